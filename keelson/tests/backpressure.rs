//! Output-buffer back-pressure: the high-water-mark callback fires on the
//! upward crossing, write-complete only once the peer drains the data, and
//! a forced close before drain produces no write-complete at all.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use keelson::{EventLoopThread, InetAddr, TcpConnection, TcpServer};

const PAYLOAD: usize = 32 * 1024 * 1024;
const MARK: usize = 4 * 1024 * 1024;

fn big_sender_server(
    lp: &Arc<keelson::EventLoop>,
    hwm_hits: Arc<AtomicUsize>,
    write_completes: Arc<AtomicUsize>,
    conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>>,
) -> Arc<TcpServer> {
    let server = TcpServer::new(lp, &InetAddr::loopback(0, false), "flood", false).unwrap();
    {
        let write_completes = write_completes.clone();
        server.set_write_complete_callback(Arc::new(move |_conn| {
            write_completes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let hwm_hits = hwm_hits.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, len| {
                    assert!(len >= MARK);
                    hwm_hits.fetch_add(1, Ordering::SeqCst);
                }),
                MARK,
            );
            *conn_slot.lock().unwrap() = Some(conn.clone());
            conn.send_bytes(bytes::Bytes::from(vec![0x5au8; PAYLOAD]));
        }
    }));
    server
}

#[test]
fn high_water_mark_then_write_complete_after_drain() {
    let mut accept_thread = EventLoopThread::new("bp-accept", None);
    let lp = accept_thread.start_loop();

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let conn_slot = Arc::new(Mutex::new(None));
    let server = big_sender_server(
        &lp,
        hwm_hits.clone(),
        write_completes.clone(),
        conn_slot.clone(),
    );
    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(addr.socket_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Do not read yet: the server's direct write fills the kernel buffers
    // and the rest lands in its output buffer, crossing the mark.
    thread::sleep(Duration::from_millis(400));
    assert!(
        hwm_hits.load(Ordering::SeqCst) >= 1,
        "high-water mark never hit"
    );
    assert_eq!(
        write_completes.load(Ordering::SeqCst),
        0,
        "write-complete before the peer read anything"
    );

    // Resume reading and drain the full payload.
    let mut total = 0usize;
    let mut chunk = vec![0u8; 256 * 1024];
    while total < PAYLOAD {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection ended early at {total} bytes");
        total += n;
    }
    assert_eq!(total, PAYLOAD);

    thread::sleep(Duration::from_millis(300));
    assert!(
        write_completes.load(Ordering::SeqCst) >= 1,
        "write-complete never fired after drain"
    );
}

#[test]
fn forced_close_before_drain_fires_no_write_complete() {
    let mut accept_thread = EventLoopThread::new("bp-force", None);
    let lp = accept_thread.start_loop();

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let conn_slot = Arc::new(Mutex::new(None));
    let server = big_sender_server(
        &lp,
        hwm_hits.clone(),
        write_completes.clone(),
        conn_slot.clone(),
    );
    let addr = server.listen_addr().unwrap();
    {
        let server = server.clone();
        lp.run_in_loop(move || server.start());
    }
    thread::sleep(Duration::from_millis(50));

    let stream = TcpStream::connect(addr.socket_addr()).unwrap();

    // Wait for the back-pressure signal, then cut the connection with the
    // output buffer still loaded.
    for _ in 0..100 {
        if hwm_hits.load(Ordering::SeqCst) >= 1 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(hwm_hits.load(Ordering::SeqCst) >= 1);

    let conn = conn_slot.lock().unwrap().clone().expect("no connection");
    assert!(conn.output_bytes() > 0, "nothing left buffered to discard");
    conn.force_close();

    thread::sleep(Duration::from_millis(300));
    assert!(conn.disconnected());
    assert_eq!(
        write_completes.load(Ordering::SeqCst),
        0,
        "forced close must not report write-complete"
    );
    drop(stream);
}
