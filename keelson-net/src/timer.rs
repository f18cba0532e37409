//! Timer entries and the opaque handle users cancel with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use keelson_core::time::Timestamp;

/// Globally unique, monotonically increasing timer sequence numbers. They
/// disambiguate a freed-then-reused timer allocation in cancel bookkeeping.
static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

pub(crate) type TimerCallback = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Timer {
    cb: TimerCallback,
    when: Mutex<Timestamp>,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(cb: TimerCallback, when: Timestamp, interval: Option<Duration>) -> Self {
        Self {
            cb,
            when: Mutex::new(when),
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn run(&self) {
        (self.cb)();
    }

    pub(crate) fn expiration(&self) -> Timestamp {
        *self.when.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn repeating(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Re-arm a repeating timer one interval past its previous expiration.
    /// If that point is already behind `now` (the loop fell behind), reseat
    /// to `now + interval`: a single catch-up step, never a burst of missed
    /// fires.
    pub(crate) fn restart(&self, now: Timestamp) {
        let interval = self.interval.expect("restart on a one-shot timer");
        let mut when = self.when.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = when.add(interval);
        if next <= now {
            next = now.add(interval);
        }
        *when = next;
    }
}

/// Opaque cancellation handle for a scheduled timer.
///
/// Holds only a weak reference, so an expired one-shot timer whose id is
/// still around does not stay allocated.
#[derive(Clone, Default)]
pub struct TimerId {
    pub(crate) timer: Weak<Timer>,
    pub(crate) sequence: u64,
}

impl TimerId {
    pub(crate) fn new(timer: &Arc<Timer>) -> Self {
        Self {
            timer: Arc::downgrade(timer),
            sequence: timer.sequence(),
        }
    }
}

impl std::fmt::Debug for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerId")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_unique_and_increasing() {
        let a = Timer::new(Box::new(|| {}), Timestamp::from_micros(1), None);
        let b = Timer::new(Box::new(|| {}), Timestamp::from_micros(1), None);
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn test_restart_steps_one_interval() {
        let t = Timer::new(
            Box::new(|| {}),
            Timestamp::from_micros(1_000),
            Some(Duration::from_micros(500)),
        );
        t.restart(Timestamp::from_micros(1_100));
        assert_eq!(t.expiration(), Timestamp::from_micros(1_500));
    }

    #[test]
    fn test_restart_reseats_when_far_behind() {
        let t = Timer::new(
            Box::new(|| {}),
            Timestamp::from_micros(1_000),
            Some(Duration::from_micros(500)),
        );
        // Three intervals late: do not burst, land one interval after now.
        t.restart(Timestamp::from_micros(2_600));
        assert_eq!(t.expiration(), Timestamp::from_micros(3_100));
    }

    #[test]
    fn test_timer_id_upgrades_while_timer_lives() {
        let t = Arc::new(Timer::new(Box::new(|| {}), Timestamp::from_micros(1), None));
        let id = TimerId::new(&t);
        assert!(id.timer.upgrade().is_some());
        drop(t);
        assert!(id.timer.upgrade().is_none());
    }
}
