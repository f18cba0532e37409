//! The level-scan backend passes the same loop mechanics as epoll.
//!
//! Lives in its own test binary because backend selection is process-wide.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keelson_net::EventLoopThread;

#[test]
fn poll_backend_drives_tasks_and_timers() {
    std::env::set_var("KEELSON_USE_POLL", "1");

    let mut t = EventLoopThread::new("poll-backend", None);
    let lp = t.start_loop();

    let tasks = Arc::new(AtomicUsize::new(0));
    let fires = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let tasks = tasks.clone();
        lp.queue_in_loop(move || {
            tasks.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let fires = fires.clone();
        lp.run_every(Duration::from_millis(25), move || {
            fires.fetch_add(1, Ordering::SeqCst);
        });
    }

    thread::sleep(Duration::from_millis(300));
    assert_eq!(tasks.load(Ordering::SeqCst), 5);
    let n = fires.load(Ordering::SeqCst);
    assert!((5..=16).contains(&n), "25ms timer fired {n} times");
}
