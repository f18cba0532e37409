//! Client reconnect behavior: failed connects back off exponentially, a
//! late-arriving server is eventually reached, and after an established
//! connection drops the retry delay starts over at the initial value.

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use keelson::{EventLoopThread, InetAddr, TcpClient};

/// Bind a listener on a free port and drop it, keeping the (likely free)
/// port number.
fn grab_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

#[test]
fn connects_on_a_backoff_attempt_once_server_appears() {
    keelson::dev_tracing::init_tracing();

    let port = grab_port();
    let addr: InetAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut loop_thread = EventLoopThread::new("reconnect", None);
    let lp = loop_thread.start_loop();

    let client = TcpClient::new(&lp, addr, "reconnect-client");
    client.enable_retry();

    let connected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        client.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    let start = Instant::now();
    client.connect();

    // Attempts run at ~0, 0.5s, 1.5s, 3.5s, ... Bring the server up after
    // the second retry is scheduled; the 3.5s attempt should land.
    thread::sleep(Duration::from_millis(1700));
    assert_eq!(
        connected.load(Ordering::SeqCst),
        0,
        "nothing was listening yet"
    );
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let (peer, _) = listener.accept().unwrap();
    let elapsed = start.elapsed();
    // Not before the scheduled attempt, not a poll-timeout late either.
    assert!(
        elapsed >= Duration::from_millis(3200),
        "connected too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(6000),
        "connected too late: {elapsed:?}"
    );

    thread::sleep(Duration::from_millis(200));
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    // Drop the established connection: the retry delay must reset, so the
    // reconnect lands in roughly INIT_RETRY_DELAY, not the backed-off 4s.
    let reconnect_start = Instant::now();
    drop(peer);
    let (_peer2, _) = listener.accept().unwrap();
    let gap = reconnect_start.elapsed();
    assert!(
        gap <= Duration::from_millis(2500),
        "reconnect delay did not reset: {gap:?}"
    );

    thread::sleep(Duration::from_millis(200));
    assert_eq!(connected.load(Ordering::SeqCst), 2);
}

#[test]
fn stop_prevents_further_attempts() {
    let port = grab_port();
    let addr: InetAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut loop_thread = EventLoopThread::new("stop-test", None);
    let lp = loop_thread.start_loop();

    let client = TcpClient::new(&lp, addr, "stopped-client");
    client.enable_retry();

    let connected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        client.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                connected.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    client.connect();
    thread::sleep(Duration::from_millis(200));
    client.stop();

    // A retry timer may still be armed; its callback must observe the stop.
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    listener.set_nonblocking(true).unwrap();
    thread::sleep(Duration::from_millis(1500));

    assert_eq!(
        connected.load(Ordering::SeqCst),
        0,
        "client connected after stop"
    );
    assert!(
        listener.accept().is_err(),
        "a connect attempt arrived after stop"
    );
}
