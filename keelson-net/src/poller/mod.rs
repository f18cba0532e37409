//! Readiness backends over the OS multiplexer.
//!
//! Two backends implement the same contract: register/modify/remove a
//! channel's interest, and fill a batch of ready channels per wait. The
//! level-scan backend (`poll(2)`) is portable and O(n) per wait; the
//! readiness-notifying backend (`epoll(7)`) is the default on Linux.
//! `KEELSON_USE_POLL` in the environment forces the level-scan backend.

mod epoll;
mod poll;

use std::sync::{Arc, Weak};

use keelson_core::time::Timestamp;

use crate::channel::Channel;
use crate::event_loop::EventLoop;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

pub(crate) trait Poller: Send {
    /// Wait up to `timeout_ms` for readiness; push ready channels (with
    /// their ready masks already written back) into `active`. The returned
    /// timestamp is sampled after the wait returns.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp;

    /// Reconcile the backend with the channel's current interest mask:
    /// ADD if new or previously removed, DEL if the mask went empty,
    /// MOD otherwise.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drop the channel from backend bookkeeping. Only valid once its
    /// interest mask is empty.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

pub(crate) fn new_default_poller(owner: Weak<EventLoop>) -> Box<dyn Poller> {
    if std::env::var_os("KEELSON_USE_POLL").is_some() {
        Box::new(PollPoller::new(owner))
    } else {
        Box::new(EpollPoller::new(owner))
    }
}
