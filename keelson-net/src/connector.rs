//! Client-side half-connection manager.
//!
//! Drives a non-blocking `connect(2)` to completion: an in-progress attempt
//! registers the socket for write readiness, and the writable callback
//! inspects `SO_ERROR` to decide between success, retry, and abandonment.
//! Refused/unreachable outcomes retry with exponential backoff (500ms
//! doubling to a 30s cap); a successful connect publishes the socket to the
//! owner and the connector goes quiescent until `restart`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use keelson_core::addr::InetAddr;
use keelson_core::sockets::Socket;
use tracing::{debug, error, info, trace, warn};

use crate::callbacks::ConnectorCallback;
use crate::channel::Channel;
use crate::event_loop::EventLoop;

pub(crate) const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: State,
    /// Whether the owner wants a connection. Cleared by `stop`; checked by
    /// retry timers that outlive it.
    connect: bool,
    retry_delay: Duration,
    /// In-flight socket while `Connecting`.
    socket: Option<Socket>,
    channel: Option<Arc<Channel>>,
    new_connection_cb: Option<ConnectorCallback>,
}

pub struct Connector {
    owner: Weak<EventLoop>,
    server_addr: InetAddr,
    self_weak: Weak<Connector>,
    inner: Mutex<Inner>,
}

impl Connector {
    pub fn new(lp: &Arc<EventLoop>, server_addr: InetAddr) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            owner: Arc::downgrade(lp),
            server_addr,
            self_weak: self_weak.clone(),
            inner: Mutex::new(Inner {
                state: State::Disconnected,
                connect: false,
                retry_delay: INIT_RETRY_DELAY,
                socket: None,
                channel: None,
                new_connection_cb: None,
            }),
        })
    }

    pub(crate) fn set_new_connection_callback(&self, cb: ConnectorCallback) {
        self.lock().new_connection_cb = Some(cb);
    }

    #[must_use]
    pub fn server_addr(&self) -> InetAddr {
        self.server_addr
    }

    /// Begin connecting. Safe from any thread.
    pub fn start(&self) {
        self.lock().connect = true;
        if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.run_in_loop(move || me.start_in_loop());
        }
    }

    /// Abort the current attempt and stop retrying. An armed retry timer is
    /// left to fire; its callback observes the cleared connect flag.
    pub fn stop(&self) {
        self.lock().connect = false;
        if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
            lp.queue_in_loop(move || me.stop_in_loop());
        }
    }

    /// Reset backoff and reconnect immediately. Loop thread only.
    pub(crate) fn restart(&self) {
        self.assert_in_loop_thread();
        {
            let mut inner = self.lock();
            inner.state = State::Disconnected;
            inner.retry_delay = INIT_RETRY_DELAY;
            inner.connect = true;
        }
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.assert_in_loop_thread();
        let connect = {
            let inner = self.lock();
            assert_eq!(inner.state, State::Disconnected);
            inner.connect
        };
        if connect {
            self.connect();
        } else {
            debug!(peer = %self.server_addr, "connector stopped before attempt");
        }
    }

    fn stop_in_loop(&self) {
        self.assert_in_loop_thread();
        if self.lock().state == State::Connecting {
            self.lock().state = State::Disconnected;
            if let Some(sock) = self.remove_and_reset_channel() {
                self.retry(sock);
            }
        }
    }

    fn connect(&self) {
        let sock = match Socket::new_nonblocking(self.server_addr.is_ipv6()) {
            Ok(s) => s,
            Err(e) => panic!("cannot create socket for connector: {e}"),
        };
        match sock.connect(&self.server_addr) {
            Ok(()) => self.connecting(sock),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => self.connecting(sock),
                Some(
                    libc::EAGAIN
                    | libc::EADDRINUSE
                    | libc::EADDRNOTAVAIL
                    | libc::ECONNREFUSED
                    | libc::ENETUNREACH,
                ) => self.retry(sock),
                _ => {
                    // Not a transient condition; abandon the attempt.
                    error!(peer = %self.server_addr, error = %e, "connect failed");
                    drop(sock);
                }
            },
        }
    }

    fn connecting(&self, sock: Socket) {
        let channel = Channel::new(self.owner.clone(), sock.fd());
        {
            let mut inner = self.lock();
            inner.state = State::Connecting;
            inner.socket = Some(sock);
            inner.channel = Some(channel.clone());
        }
        let weak = self.self_weak.clone();
        channel.set_write_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        });
        let weak = self.self_weak.clone();
        channel.set_error_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        });
        // A refused connect reports HUP; that is the expected failure shape
        // here, not something to warn about.
        channel.set_log_hup(false);
        channel.enable_writing();
    }

    /// Detach and unregister the in-flight channel, handing back the socket.
    /// Runs inside the channel's own dispatch, which the loop permits for
    /// the currently dispatching channel.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let (channel, sock) = {
            let mut inner = self.lock();
            (inner.channel.take(), inner.socket.take())
        };
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
        sock
    }

    fn handle_write(&self) {
        let state = self.lock().state;
        trace!(?state, "connector writable");
        if state != State::Connecting {
            debug_assert_eq!(state, State::Disconnected);
            return;
        }
        let Some(sock) = self.remove_and_reset_channel() else {
            return;
        };
        match sock.take_error() {
            Ok(Some(err)) => {
                warn!(peer = %self.server_addr, error = %err, "SO_ERROR after connect");
                self.retry(sock);
            }
            Err(e) => {
                warn!(peer = %self.server_addr, error = %e, "SO_ERROR probe failed");
                self.retry(sock);
            }
            Ok(None) => {
                if sock.is_self_connect() {
                    warn!(peer = %self.server_addr, "self connect");
                    self.retry(sock);
                } else {
                    let (connect, cb) = {
                        let mut inner = self.lock();
                        inner.state = State::Connected;
                        (inner.connect, inner.new_connection_cb.clone())
                    };
                    if connect {
                        if let Some(cb) = cb {
                            cb(sock);
                        }
                    } else {
                        drop(sock);
                    }
                }
            }
        }
    }

    fn handle_error(&self) {
        let state = self.lock().state;
        error!(?state, peer = %self.server_addr, "connector error event");
        if state == State::Connecting {
            if let Some(sock) = self.remove_and_reset_channel() {
                if let Ok(Some(err)) = sock.take_error() {
                    warn!(error = %err, "SO_ERROR");
                }
                self.retry(sock);
            }
        }
    }

    /// Close the failed socket and schedule the next attempt with doubled
    /// delay. The timer holds a weak self-reference, so a torn-down client
    /// does not keep the connector alive just to observe a no-op fire.
    fn retry(&self, sock: Socket) {
        drop(sock);
        let (connect, delay) = {
            let mut inner = self.lock();
            inner.state = State::Disconnected;
            let delay = inner.retry_delay;
            inner.retry_delay = next_retry_delay(delay);
            (inner.connect, delay)
        };
        if connect {
            info!(peer = %self.server_addr, delay_ms = delay.as_millis() as u64, "retrying connect");
            if let Some(lp) = self.owner.upgrade() {
                let weak = self.self_weak.clone();
                lp.run_after(delay, move || {
                    if let Some(c) = weak.upgrade() {
                        c.start_in_loop();
                    }
                });
            }
        } else {
            debug!(peer = %self.server_addr, "not retrying, connector stopped");
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

fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut d = INIT_RETRY_DELAY;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(d);
            d = next_retry_delay(d);
        }
        assert_eq!(seen[0], Duration::from_millis(500));
        assert_eq!(seen[1], Duration::from_secs(1));
        assert_eq!(seen[2], Duration::from_secs(2));
        assert_eq!(seen[6], Duration::from_secs(30));
        assert_eq!(seen[7], Duration::from_secs(30));
    }
}
