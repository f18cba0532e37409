//! Repeated `force_close` calls traverse the close path exactly once.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use keelson::{EventLoopThread, InetAddr, TcpServer};

#[test]
fn force_close_is_idempotent() {
    let mut accept_thread = EventLoopThread::new("fc-accept", None);
    let lp = accept_thread.start_loop();

    let server = TcpServer::new(&lp, &InetAddr::loopback(0, false), "fc", false).unwrap();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (conn_tx, conn_rx) = mpsc::channel();
    {
        let disconnects = disconnects.clone();
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn_tx.send(conn.clone()).unwrap();
            } else {
                disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let stream = TcpStream::connect(addr.socket_addr()).unwrap();
    let conn = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("never connected");

    for _ in 0..5 {
        conn.force_close();
    }
    thread::sleep(Duration::from_millis(300));

    assert!(conn.disconnected());
    assert_eq!(
        disconnects.load(Ordering::SeqCst),
        1,
        "close path ran more than once"
    );

    // Still idempotent after the connection is already down.
    conn.force_close();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    drop(stream);
}
