//! Concurrent cross-thread sends on one connection: every byte arrives,
//! and no connection callback ever runs on a sender thread.

use std::collections::HashSet;
use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use keelson::{EventLoopThread, InetAddr, TcpClient};

const SENDERS: usize = 8;
const SENDS_PER_THREAD: usize = 200;
const CHUNK: usize = 125;

#[test]
fn eight_threads_share_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: InetAddr = listener.local_addr().unwrap().into();

    // Peer: accept one connection and count bytes until EOF.
    let reader = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut total = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => panic!("reader failed: {e}"),
            }
        }
        total
    });

    let mut loop_thread = EventLoopThread::new("xthread", None);
    let lp = loop_thread.start_loop();

    let callback_threads: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let client = TcpClient::new(&lp, addr, "xthread-client");
    let (conn_tx, conn_rx) = mpsc::channel();
    {
        let callback_threads = callback_threads.clone();
        client.set_connection_callback(Arc::new(move |conn| {
            callback_threads
                .lock()
                .unwrap()
                .insert(thread::current().id());
            if conn.connected() {
                conn_tx.send(conn.clone()).unwrap();
            }
        }));
    }
    {
        let callback_threads = callback_threads.clone();
        let write_completes = write_completes.clone();
        client.set_write_complete_callback(Arc::new(move |_conn| {
            callback_threads
                .lock()
                .unwrap()
                .insert(thread::current().id());
            write_completes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    client.connect();

    let conn = conn_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("never connected");

    let senders: Vec<_> = (0..SENDERS)
        .map(|i| {
            let conn = conn.clone();
            thread::spawn(move || {
                let payload = [i as u8; CHUNK];
                for _ in 0..SENDS_PER_THREAD {
                    conn.send(&payload);
                }
                thread::current().id()
            })
        })
        .collect();
    let sender_ids: Vec<ThreadId> = senders.into_iter().map(|h| h.join().unwrap()).collect();

    // Half-close once the queued sends drain; the peer then sees EOF.
    conn.shutdown();

    let total = reader.join().unwrap();
    assert_eq!(total, SENDERS * SENDS_PER_THREAD * CHUNK);

    thread::sleep(Duration::from_millis(100));
    let seen = callback_threads.lock().unwrap();
    assert!(!seen.is_empty());
    for id in &sender_ids {
        assert!(
            !seen.contains(id),
            "a connection callback ran on a sender thread"
        );
    }
    assert!(
        write_completes.load(Ordering::SeqCst) >= 1,
        "write-complete never observed"
    );
}
