//! Per-descriptor event registration and dispatch record.
//!
//! A `Channel` binds one file descriptor to an interest mask and a set of
//! event callbacks. It never owns the descriptor; closing belongs to the
//! resource owner (socket, wake eventfd, timer fd). Interest changes
//! reconcile with the poller through the owning loop, and dispatch happens
//! when the loop hands the channel its ready mask after a poll.

use std::any::Any;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use keelson_core::time::Timestamp;
use tracing::{trace, warn};

use crate::event_loop::EventLoop;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::POLLOUT as u32;

const IN: u32 = libc::POLLIN as u32;
const PRI: u32 = libc::POLLPRI as u32;
const OUT: u32 = libc::POLLOUT as u32;
const HUP: u32 = libc::POLLHUP as u32;
const RDHUP: u32 = libc::POLLRDHUP as u32;
const ERR: u32 = libc::POLLERR as u32;
const NVAL: u32 = libc::POLLNVAL as u32;

type ReadCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    events: u32,
    revents: u32,
    /// Backend bookkeeping slot: array index for the level-scan poller,
    /// add-state for the readiness poller. `-1` means "not registered yet".
    index: i32,
    log_hup: bool,
    event_handling: bool,
    added_to_loop: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

/// One descriptor's subscription to readiness events.
pub struct Channel {
    fd: RawFd,
    owner: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    inner: Mutex<Inner>,
}

impl Channel {
    pub(crate) fn new(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            fd,
            owner,
            self_weak: self_weak.clone(),
            inner: Mutex::new(Inner {
                events: NONE_EVENT,
                revents: 0,
                index: -1,
                log_hup: true,
                event_handling: false,
                added_to_loop: false,
                tie: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            }),
        })
    }

    #[inline]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_read_callback(&self, cb: impl Fn(Timestamp) + Send + Sync + 'static) {
        self.lock().read_cb = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.lock().write_cb = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.lock().close_cb = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.lock().error_cb = Some(Arc::new(cb));
    }

    /// Tie this channel to its owning object.
    ///
    /// During dispatch the weak reference is upgraded and held until the
    /// last callback returns, so a user callback that drops the final
    /// handle mid-dispatch cannot free state the remaining callbacks touch.
    /// A failed upgrade skips dispatch entirely.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        self.lock().tie = Some(Arc::downgrade(owner));
    }

    /// Suppress the warn log for a bare `POLLHUP` (used by the connector,
    /// where hangup is an expected connect failure).
    pub fn set_log_hup(&self, on: bool) {
        self.lock().log_hup = on;
    }

    pub fn enable_reading(&self) {
        self.lock().events |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&self) {
        self.lock().events &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&self) {
        self.lock().events |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&self) {
        self.lock().events &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&self) {
        self.lock().events = NONE_EVENT;
        self.update();
    }

    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.lock().events & READ_EVENT != 0
    }

    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.lock().events & WRITE_EVENT != 0
    }

    #[must_use]
    pub fn is_none_event(&self) -> bool {
        self.lock().events == NONE_EVENT
    }

    /// Unregister from the poller. Interest must already be empty.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        self.lock().added_to_loop = false;
        if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.remove_channel(&me);
        }
    }

    /// Dispatch the ready mask set by the poller, in close/error/read/write
    /// order. A bare `POLLHUP` (no `POLLIN`) is a close; `POLLIN|POLLHUP`
    /// still delivers the read first, because the read path may surface
    /// bytes the peer sent before shutting down.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let mut _guard: Option<Arc<dyn Any + Send + Sync>> = None;
        let (revents, log_hup, read_cb, write_cb, close_cb, error_cb) = {
            let mut inner = self.lock();
            if let Some(tie) = &inner.tie {
                match tie.upgrade() {
                    Some(owner) => _guard = Some(owner),
                    None => return,
                }
            }
            inner.event_handling = true;
            (
                inner.revents,
                inner.log_hup,
                inner.read_cb.clone(),
                inner.write_cb.clone(),
                inner.close_cb.clone(),
                inner.error_cb.clone(),
            )
        };

        trace!(fd = self.fd, revents = %events_to_string(revents), "dispatch");

        if revents & HUP != 0 && revents & IN == 0 {
            if log_hup {
                warn!(fd = self.fd, "POLLHUP without POLLIN");
            }
            if let Some(cb) = &close_cb {
                cb();
            }
        }
        if revents & NVAL != 0 {
            warn!(fd = self.fd, "POLLNVAL on registered descriptor");
        }
        if revents & (ERR | NVAL) != 0 {
            if let Some(cb) = &error_cb {
                cb();
            }
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            if let Some(cb) = &read_cb {
                cb(receive_time);
            }
        }
        if revents & OUT != 0 {
            if let Some(cb) = &write_cb {
                cb();
            }
        }

        self.lock().event_handling = false;
    }

    pub(crate) fn events(&self) -> u32 {
        self.lock().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.lock().revents = revents;
    }

    pub(crate) fn is_added_to_loop(&self) -> bool {
        self.lock().added_to_loop
    }

    pub(crate) fn index(&self) -> i32 {
        self.lock().index
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.lock().index = index;
    }

    pub(crate) fn is_owned_by(&self, lp: &Arc<EventLoop>) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|own| Arc::ptr_eq(&own, lp))
    }

    fn update(&self) {
        self.lock().added_to_loop = true;
        if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.update_channel(&me);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.lock().event_handling);
    }
}

fn events_to_string(ev: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (IN, "IN"),
        (PRI, "PRI"),
        (OUT, "OUT"),
        (HUP, "HUP"),
        (RDHUP, "RDHUP"),
        (ERR, "ERR"),
        (NVAL, "NVAL"),
    ] {
        if ev & bit != 0 {
            let _ = write!(out, "{name} ");
        }
    }
    out
}
