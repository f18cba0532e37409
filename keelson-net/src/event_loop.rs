//! Single-threaded reactor.
//!
//! An `EventLoop` is pinned to the thread that constructed it: only that
//! thread may run it, and every channel, timer, and connection bound to it
//! is mutated on that thread. Other threads hand work over through
//! [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`]; an eventfd
//! registered as a read-only channel wakes the poller so queued tasks run in
//! the drain phase of the next iteration.
//!
//! One iteration: wait on the poller (bounded so an idle loop still makes
//! progress), dispatch every ready channel, then swap-drain the task queue.
//! Tasks queued while draining run in the next iteration, so the poll phase
//! is never starved.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use keelson_core::time::Timestamp;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

/// Upper bound on one poller wait, so a loop with no registered work still
/// observes `quit` and task wakeups promptly even if a wake write is lost.
const POLL_TIME_MS: i32 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

/// The single-threaded event demultiplexer.
///
/// Shared as `Arc<EventLoop>`; the loop-thread-only interior (poller, active
/// list) sits behind mutexes that only the owning thread locks, and the
/// thread pin is enforced at runtime.
pub struct EventLoop {
    thread_id: ThreadId,
    self_weak: Weak<EventLoop>,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poll_return_micros: AtomicU64,
    poller: Mutex<Box<dyn Poller>>,
    timer_queue: Arc<TimerQueue>,
    wake_fd: OwnedFd,
    wake_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
    active_channels: Mutex<Vec<Arc<Channel>>>,
    current_active: Mutex<Option<Arc<Channel>>>,
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already owns a live `EventLoop`.
    pub fn new() -> Arc<Self> {
        ignore_sigpipe_once();
        CURRENT_LOOP.with(|cur| {
            assert!(
                cur.borrow().upgrade().is_none(),
                "another EventLoop already exists on thread {:?}",
                thread::current().id()
            );
        });

        let wake_fd = create_eventfd();
        let lp = Arc::new_cyclic(|self_weak: &Weak<EventLoop>| EventLoop {
            thread_id: thread::current().id(),
            self_weak: self_weak.clone(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_micros: AtomicU64::new(0),
            poller: Mutex::new(poller::new_default_poller(self_weak.clone())),
            timer_queue: TimerQueue::new(self_weak.clone()),
            wake_channel: Channel::new(self_weak.clone(), wake_fd.as_raw_fd()),
            wake_fd,
            pending: Mutex::new(Vec::new()),
            active_channels: Mutex::new(Vec::new()),
            current_active: Mutex::new(None),
        });

        // Registration goes through the weak self-reference, which only
        // upgrades once the Arc above exists.
        let weak = Arc::downgrade(&lp);
        lp.wake_channel.set_read_callback(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.handle_wake_read();
            }
        });
        lp.wake_channel.enable_reading();
        lp.timer_queue.register();

        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Arc::downgrade(&lp));
        debug!(thread = ?lp.thread_id, "event loop created");
        lp
    }

    /// The loop owned by the calling thread, if one exists.
    #[must_use]
    pub fn current() -> Option<Arc<Self>> {
        CURRENT_LOOP.with(|cur| cur.borrow().upgrade())
    }

    /// Run the loop until [`EventLoop::quit`]. Must be called exactly once,
    /// on the owning thread.
    pub fn run(&self) {
        assert!(
            !self.looping.swap(true, Ordering::SeqCst),
            "EventLoop::run called twice"
        );
        self.assert_in_loop_thread();
        self.quit.store(false, Ordering::SeqCst);
        debug!("event loop starts");

        while !self.quit.load(Ordering::Acquire) {
            let now = {
                let mut active = self.lock(&self.active_channels);
                active.clear();
                let mut poller = self.lock(&self.poller);
                poller.poll(POLL_TIME_MS, &mut active)
            };
            self.iteration.fetch_add(1, Ordering::Relaxed);
            self.poll_return_micros
                .store(now.as_micros(), Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Release);
            let snapshot = self.lock(&self.active_channels).clone();
            for channel in &snapshot {
                *self.lock(&self.current_active) = Some(channel.clone());
                channel.handle_event(now);
            }
            *self.lock(&self.current_active) = None;
            self.event_handling.store(false, Ordering::Release);

            self.do_pending_tasks();
        }

        debug!("event loop stops");
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Ask the loop to exit after the current iteration. Safe from any
    /// thread; a cross-thread quit wakes the poller.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the drain phase of a subsequent iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.lock(&self.pending).push(Box::new(task));
        // A task queued from the loop thread mid-drain still needs a wake:
        // the current drain already swapped the queue out.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of tasks waiting for the next drain.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.lock(&self.pending).len()
    }

    /// Run `cb` at the absolute monotonic time `when`.
    pub fn run_at(&self, when: Timestamp, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timer_queue.add_timer(Box::new(cb), when, None)
    }

    /// Run `cb` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), cb)
    }

    /// Run `cb` every `interval`, first fire one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timer_queue
            .add_timer(Box::new(cb), Timestamp::now().add(interval), Some(interval))
    }

    /// Best-effort cancel. A callback already executing runs to completion;
    /// a repeating timer in the current expired batch will not re-arm.
    pub fn cancel(&self, id: TimerId) {
        self.timer_queue.cancel(id);
    }

    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Abort with a diagnostic when called off the owning thread. Wrong
    /// thread access is a contract violation, not a recoverable error.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop owned by thread {:?} was accessed from thread {:?}",
            self.thread_id,
            thread::current().id()
        );
    }

    /// Completed iteration count; useful for liveness checks.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// Timestamp sampled when the last poller wait returned.
    #[must_use]
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_micros.load(Ordering::Relaxed))
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.is_owned_by(&self.arc()));
        self.assert_in_loop_thread();
        self.lock(&self.poller).update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.is_owned_by(&self.arc()));
        self.assert_in_loop_thread();
        if self.event_handling.load(Ordering::Acquire) {
            // Removing a later entry of the active list would dispatch freed
            // state; only the currently dispatching channel (or one not in
            // the list at all) may go.
            let is_current = self
                .lock(&self.current_active)
                .as_ref()
                .is_some_and(|cur| Arc::ptr_eq(cur, channel));
            assert!(
                is_current
                    || !self
                        .lock(&self.active_channels)
                        .iter()
                        .any(|ch| Arc::ptr_eq(ch, channel)),
                "removing a channel still pending dispatch"
            );
        }
        self.lock(&self.poller).remove_channel(channel);
    }

    /// Whether `channel` is currently registered with this loop's poller.
    /// Loop thread only.
    #[must_use]
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.lock(&self.poller).has_channel(channel)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("loop already destroyed")
    }

    /// Write one token to the wake eventfd. Level-triggered and coalescing:
    /// many queued tasks cost at most one extra wait-return.
    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            error!(n, "wakeup write was short");
        }
    }

    fn handle_wake_read(&self) {
        let mut token: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                std::ptr::addr_of_mut!(token).cast::<libc::c_void>(),
                mem::size_of::<u64>(),
            )
        };
        if n != mem::size_of::<u64>() as isize {
            error!(n, "wakeup read was short");
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // Swap-drain: tasks run outside the lock so they can queue further
        // tasks (which land in the next iteration) without deadlock.
        let tasks = mem::take(&mut *self.lock(&self.pending));
        trace!(count = tasks.len(), "draining pending tasks");
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(thread = ?self.thread_id, "event loop destroyed");
        if self.is_in_loop_thread() {
            CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Weak::new());
        }
    }
}

fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(fd >= 0, "eventfd failed: {}", io::Error::last_os_error());
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Writes to a peer that already closed must surface as `EPIPE` from the
/// syscall, not kill the process.
fn ignore_sigpipe_once() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
