//! Repeating timers at mixed intervals fire at their own rates, and
//! cancelling one mid-run stops only that one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keelson_net::EventLoopThread;

#[test]
fn mixed_interval_timers_keep_their_rates() {
    let mut t = EventLoopThread::new("fairness", None);
    let lp = t.start_loop();

    let fast = Arc::new(AtomicUsize::new(0));
    let mid = Arc::new(AtomicUsize::new(0));
    let slow = Arc::new(AtomicUsize::new(0));

    {
        let fast = fast.clone();
        lp.run_every(Duration::from_millis(10), move || {
            fast.fetch_add(1, Ordering::SeqCst);
        });
    }
    let mid_id = {
        let mid = mid.clone();
        lp.run_every(Duration::from_millis(20), move || {
            mid.fetch_add(1, Ordering::SeqCst);
        })
    };
    {
        let slow = slow.clone();
        lp.run_every(Duration::from_millis(50), move || {
            slow.fetch_add(1, Ordering::SeqCst);
        });
    }

    thread::sleep(Duration::from_millis(300));
    lp.cancel(mid_id);
    thread::sleep(Duration::from_millis(50));
    let mid_after_cancel = mid.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(300));

    let fast_n = fast.load(Ordering::SeqCst);
    let mid_n = mid.load(Ordering::SeqCst);
    let slow_n = slow.load(Ordering::SeqCst);

    // ~650ms of runtime for fast and slow, ~300ms for mid. Bounds are wide
    // for loaded CI machines but tight enough to catch rate errors (a burst
    // catch-up or a missed re-arm lands far outside them).
    assert!(
        (40..=70).contains(&fast_n),
        "10ms timer fired {fast_n} times"
    );
    assert!((9..=18).contains(&mid_after_cancel), "20ms timer fired {mid_after_cancel} times before cancel");
    assert!((8..=14).contains(&slow_n), "50ms timer fired {slow_n} times");

    // Cancelled: frozen after the cancel settled.
    assert_eq!(mid_n, mid_after_cancel, "20ms timer fired after cancel");

    // Relative rates hold: fast outpaces slow by roughly 5x.
    assert!(fast_n > slow_n * 3);
}
