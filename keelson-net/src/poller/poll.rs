//! Level-scan backend over `poll(2)`.
//!
//! Keeps an ordered array of pollfd records plus an fd→index map (the index
//! is cached in each channel). Disabling a channel keeps its slot, with the
//! fd bit-inverted so the kernel ignores it, which preserves index
//! stability; removal swap-pops and fixes the moved entry's cached index.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use keelson_core::time::Timestamp;
use tracing::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;

use super::Poller;

pub(crate) struct PollPoller {
    owner: Weak<EventLoop>,
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub(crate) fn new(owner: Weak<EventLoop>) -> Self {
        Self {
            owner,
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(lp) = self.owner.upgrade() {
            lp.assert_in_loop_thread();
        }
    }

    fn fill_active_channels(&self, num_events: i32, active: &mut Vec<Arc<Channel>>) {
        let mut remaining = num_events;
        for pfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            // Disabled slots carry a negative fd and never report events,
            // so this lookup only ever sees live registrations.
            let channel = self
                .channels
                .get(&pfd.fd)
                .expect("pollfd slot without a channel");
            channel.set_revents(pfd.revents as u16 as u32);
            active.push(channel.clone());
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();
        if num_events > 0 {
            trace!(num_events, "events happened");
            self.fill_active_channels(num_events, active);
        } else if num_events == 0 {
            trace!("nothing happened");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!(error = %saved, "poll failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        let fd = channel.fd();
        let index = channel.index();
        trace!(fd, events = channel.events(), index, "update channel");
        if index < 0 {
            // A new registration gets the next slot.
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index((self.pollfds.len() - 1) as i32);
            self.channels.insert(fd, channel.clone());
        } else {
            assert!(self
                .channels
                .get(&fd)
                .is_some_and(|ch| Arc::ptr_eq(ch, channel)));
            let idx = index as usize;
            assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            if channel.is_none_event() {
                // Keep the slot but make the kernel skip it.
                pfd.fd = -fd - 1;
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
        let idx = channel.index() as usize;
        assert!(idx < self.pollfds.len());

        self.channels.remove(&fd);
        self.pollfds.swap_remove(idx);
        if idx < self.pollfds.len() {
            // Fix the cached index of the entry that moved into the hole.
            let moved_fd = self.pollfds[idx].fd;
            let real_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            self.channels
                .get(&real_fd)
                .expect("moved pollfd slot without a channel")
                .set_index(idx as i32);
        }
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|ch| Arc::ptr_eq(ch, channel))
    }
}
