//! Monotonic-time timer set backed by one kernel timer descriptor.
//!
//! Timers are ordered by `(expiration, sequence)` so equal expirations stay
//! distinct. The timerfd is registered as a read-only channel on the owning
//! loop and always armed for the earliest expiration; on fire, the expired
//! prefix is extracted as a batch, every callback runs, and repeating
//! non-cancelled timers re-arm and reinsert.
//!
//! All mutation funnels onto the loop thread via `run_in_loop`, which makes
//! the public `add_timer`/`cancel` safe from any thread.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use keelson_core::time::Timestamp;
use smallvec::SmallVec;
use tracing::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timer::{Timer, TimerCallback, TimerId};

struct Inner {
    /// Scheduled timers keyed by `(expiration, sequence)`.
    timers: BTreeMap<(Timestamp, u64), Arc<Timer>>,
    /// Set while the expired batch is running its callbacks.
    calling_expired: bool,
    /// Sequences cancelled from inside the current expired batch; the
    /// re-arm step drops them instead of reinserting.
    canceling: HashSet<u64>,
}

pub(crate) struct TimerQueue {
    owner: Weak<EventLoop>,
    self_weak: Weak<TimerQueue>,
    timer_fd: OwnedFd,
    channel: Arc<Channel>,
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<EventLoop>) -> Arc<Self> {
        let timer_fd = create_timerfd();
        Arc::new_cyclic(|self_weak| Self {
            channel: Channel::new(owner.clone(), timer_fd.as_raw_fd()),
            owner,
            self_weak: self_weak.clone(),
            timer_fd,
            inner: Mutex::new(Inner {
                timers: BTreeMap::new(),
                calling_expired: false,
                canceling: HashSet::new(),
            }),
        })
    }

    /// Hook the timerfd channel up and start watching it. Called by the
    /// loop once its own Arc exists.
    pub(crate) fn register(&self) {
        let weak = self.self_weak.clone();
        self.channel.set_read_callback(move |_| {
            if let Some(tq) = weak.upgrade() {
                tq.handle_read();
            }
        });
        self.channel.enable_reading();
    }

    /// Schedule `cb` at `when`, repeating every `interval` if given. Safe
    /// from any thread.
    pub(crate) fn add_timer(
        &self,
        cb: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        let timer = Arc::new(Timer::new(cb, when, interval));
        let id = TimerId::new(&timer);
        if let (Some(lp), Some(tq)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.run_in_loop(move || tq.add_timer_in_loop(timer));
        }
        id
    }

    /// Best-effort cancel. Safe from any thread.
    pub(crate) fn cancel(&self, id: TimerId) {
        if let (Some(lp), Some(tq)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.run_in_loop(move || tq.cancel_in_loop(&id));
        }
    }

    fn add_timer_in_loop(&self, timer: Arc<Timer>) {
        self.assert_in_loop_thread();
        let when = timer.expiration();
        let earliest_changed = {
            let mut inner = self.lock();
            let earliest = inner.timers.keys().next().map(|(t, _)| *t);
            inner.timers.insert((when, timer.sequence()), timer);
            earliest.map_or(true, |t| when < t)
        };
        if earliest_changed {
            reset_timerfd(self.timer_fd.as_raw_fd(), when);
        }
    }

    fn cancel_in_loop(&self, id: &TimerId) {
        self.assert_in_loop_thread();
        // A dead weak means the timer already fired without repeat and was
        // dropped; nothing to do.
        let Some(timer) = id.timer.upgrade() else {
            return;
        };
        let mut inner = self.lock();
        let key = (timer.expiration(), id.sequence);
        if inner.timers.remove(&key).is_some() {
            trace!(sequence = id.sequence, "timer cancelled");
        } else if inner.calling_expired {
            // Mid-batch: the timer already fired this round; stop its re-arm.
            inner.canceling.insert(id.sequence);
        }
    }

    fn handle_read(&self) {
        self.assert_in_loop_thread();
        read_timerfd(self.timer_fd.as_raw_fd());
        let now = Timestamp::now();

        let expired: SmallVec<[Arc<Timer>; 8]> = {
            let mut inner = self.lock();
            // Everything strictly before (now, u64::MAX) is due.
            let not_expired = inner.timers.split_off(&(now, u64::MAX));
            let due = mem::replace(&mut inner.timers, not_expired);
            inner.calling_expired = true;
            inner.canceling.clear();
            due.into_values().collect()
        };
        trace!(count = expired.len(), %now, "timers expired");

        for timer in &expired {
            timer.run();
        }

        self.reset_after_batch(&expired, now);
    }

    fn reset_after_batch(&self, expired: &[Arc<Timer>], now: Timestamp) {
        let mut inner = self.lock();
        for timer in expired {
            if timer.repeating() && !inner.canceling.contains(&timer.sequence()) {
                timer.restart(now);
                inner
                    .timers
                    .insert((timer.expiration(), timer.sequence()), timer.clone());
            }
        }
        inner.calling_expired = false;
        let next = inner.timers.keys().next().map(|(t, _)| *t);
        drop(inner);
        if let Some(next) = next {
            reset_timerfd(self.timer_fd.as_raw_fd(), next);
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(lp) = self.owner.upgrade() {
            lp.assert_in_loop_thread();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn create_timerfd() -> OwnedFd {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    assert!(
        fd >= 0,
        "timerfd_create failed: {}",
        io::Error::last_os_error()
    );
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Arm the timerfd for the absolute monotonic `expiration`, expressed
/// relative to now (never less than 100us so an already-due timer still
/// produces a readable token instead of disarming the fd).
fn reset_timerfd(fd: RawFd, expiration: Timestamp) {
    let delta = expiration
        .duration_since(Timestamp::now())
        .max(Duration::from_micros(100));
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delta.as_secs() as libc::time_t,
            tv_nsec: i64::from(delta.subsec_nanos()) as libc::c_long,
        },
    };
    let rc = unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) };
    if rc != 0 {
        error!(error = %io::Error::last_os_error(), "timerfd_settime failed");
    }
}

fn read_timerfd(fd: RawFd) {
    let mut howmany: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            std::ptr::addr_of_mut!(howmany).cast::<libc::c_void>(),
            mem::size_of::<u64>(),
        )
    };
    if n != mem::size_of::<u64>() as isize {
        error!(n, "timerfd read was short");
    }
}
