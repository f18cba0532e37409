//! End-to-end echo: a two-worker server echoes bytes back, and a connection
//! produces exactly one Connected and one Disconnected callback.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keelson::{EventLoopThread, InetAddr, TcpServer};

#[test]
fn echo_round_trip() {
    keelson::dev_tracing::init_tracing();

    let mut accept_thread = EventLoopThread::new("echo-accept", None);
    let lp = accept_thread.start_loop();

    let server = TcpServer::new(&lp, &InetAddr::loopback(0, false), "echo", false).unwrap();
    server.set_thread_num(2);

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        let disconnected = disconnected.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected.fetch_add(1, Ordering::SeqCst);
            } else {
                disconnected.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send_bytes(msg);
    }));

    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(addr.socket_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    drop(stream);
    thread::sleep(Duration::from_millis(200));

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn echo_on_accept_loop_when_pool_is_empty() {
    let mut accept_thread = EventLoopThread::new("echo-single", None);
    let lp = accept_thread.start_loop();

    let server = TcpServer::new(&lp, &InetAddr::loopback(0, false), "echo0", false).unwrap();
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send_bytes(msg);
    }));

    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(addr.socket_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    for round in 0..5u8 {
        let msg = [round; 32];
        stream.write_all(&msg).unwrap();
        let mut reply = [0u8; 32];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg);
    }
}

#[test]
fn two_concurrent_clients_get_their_own_bytes() {
    let mut accept_thread = EventLoopThread::new("echo-multi", None);
    let lp = accept_thread.start_loop();

    let server = TcpServer::new(&lp, &InetAddr::loopback(0, false), "echo2", false).unwrap();
    server.set_thread_num(2);
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let msg = buf.retrieve_all_as_bytes();
        conn.send_bytes(msg);
    }));
    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let workers: Vec<_> = (0..2u8)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr.socket_addr()).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                let msg = [i + 1; 64];
                for _ in 0..10 {
                    stream.write_all(&msg).unwrap();
                    let mut reply = [0u8; 64];
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(reply, msg);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}
