//! Readiness-notifying backend over `epoll(7)`.
//!
//! The kernel keeps the interest set; each wait fills a scratch array that
//! doubles when saturated. Channels move through a tri-state registration
//! machine cached in their index slot: New → Added on the first non-empty
//! mask (kernel ADD), Added → Deleted when the mask goes empty (kernel DEL),
//! Deleted → Added on re-enable (kernel ADD again). Removal returns the
//! channel to New.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use keelson_core::time::Timestamp;
use tracing::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

use super::Poller;

// The poll(2) constants double as epoll constants; the dispatch masks in
// `channel` rely on it.
const _: () = assert!(libc::EPOLLIN as u32 == libc::POLLIN as u32);
const _: () = assert!(libc::EPOLLPRI as u32 == libc::POLLPRI as u32);
const _: () = assert!(libc::EPOLLOUT as u32 == libc::POLLOUT as u32);
const _: () = assert!(libc::EPOLLRDHUP as u32 == libc::POLLRDHUP as u32);
const _: () = assert!(libc::EPOLLERR as u32 == libc::POLLERR as u32);
const _: () = assert!(libc::EPOLLHUP as u32 == libc::POLLHUP as u32);

/// Registration states cached in the channel's index slot.
const STATE_NEW: i32 = -1;
const STATE_ADDED: i32 = 1;
const STATE_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    owner: Weak<EventLoop>,
    epoll_fd: OwnedFd,
    /// Scratch output array for `epoll_wait`, grown 2x on saturation.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new(owner: Weak<EventLoop>) -> Self {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            fd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );
        Self {
            owner,
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(lp) = self.owner.upgrade() {
            lp.assert_in_loop_thread();
        }
    }

    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for ev in &self.events[..num_events] {
            // The udata slot carries the fd; the map owns the channel.
            let fd = ev.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("epoll event for unregistered fd");
            channel.set_revents(ev.events);
            active.push(channel.clone());
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) {
        let mut ev = libc::epoll_event {
            events: channel.events(),
            u64: channel.fd() as u64,
        };
        let fd = channel.fd();
        let ev_events = ev.events;
        trace!(fd, op = op_name(op), events = ev_events, "epoll_ctl");
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, error = %err, "epoll_ctl DEL failed");
            } else {
                panic!("epoll_ctl {} for fd {fd} failed: {err}", op_name(op));
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!(fd_count = self.channels.len(), "polling");
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();
        if num_events > 0 {
            trace!(num_events, "events happened");
            self.fill_active_channels(num_events as usize, active);
            if num_events as usize == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!(error = %saved, "epoll_wait failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        let fd = channel.fd();
        let state = channel.index();
        trace!(fd, events = channel.events(), state, "update channel");
        if state == STATE_NEW || state == STATE_DELETED {
            if state == STATE_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self
                    .channels
                    .get(&fd)
                    .is_some_and(|ch| Arc::ptr_eq(ch, channel)));
            }
            channel.set_index(STATE_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self
                .channels
                .get(&fd)
                .is_some_and(|ch| Arc::ptr_eq(ch, channel)));
            assert_eq!(state, STATE_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(STATE_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        let fd = channel.fd();
        trace!(fd, "remove channel");
        assert!(self
            .channels
            .get(&fd)
            .is_some_and(|ch| Arc::ptr_eq(ch, channel)));
        assert!(channel.is_none_event());
        let state = channel.index();
        assert!(state == STATE_ADDED || state == STATE_DELETED);
        self.channels.remove(&fd);
        if state == STATE_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(STATE_NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|ch| Arc::ptr_eq(ch, channel))
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}
