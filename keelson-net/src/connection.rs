//! Per-connection state machine.
//!
//! A `TcpConnection` owns one connected socket and its channel, an input
//! buffer the message callback consumes from, and an output buffer that
//! absorbs whatever the kernel would not take synchronously. It is shared as
//! `Arc<TcpConnection>`: user code may hold it from any thread, but every
//! state mutation happens on the owning loop thread (cross-thread `send`,
//! `shutdown` and `force_close` funnel through the loop's task queue).
//!
//! Lifecycle: `Connecting` until the owner calls `connect_established`, then
//! `Connected`; `shutdown` moves to `Disconnecting` (write side closes once
//! the output buffer drains); peer close or `force_close` runs the close
//! path to `Disconnected`, and `connect_destroyed` retires the channel.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use keelson_core::addr::InetAddr;
use keelson_core::buffer::Buffer;
use keelson_core::sockets::{self, Socket};
use keelson_core::time::Timestamp;
use tracing::{debug, error, trace, warn};

use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;

/// Default output-buffer back-pressure threshold: 64 MiB.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    owner: Weak<EventLoop>,
    self_weak: Weak<TcpConnection>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    destroyed: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl TcpConnection {
    /// Wrap an already-connected socket. The caller (server or client)
    /// wires callbacks and then dispatches [`TcpConnection::connect_established`]
    /// on the owning loop.
    pub(crate) fn new(
        lp: &Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> Arc<Self> {
        let conn = Arc::new_cyclic(|self_weak| Self {
            owner: Arc::downgrade(lp),
            self_weak: self_weak.clone(),
            channel: Channel::new(Arc::downgrade(lp), socket.fd()),
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            socket,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |t| {
            if let Some(c) = weak.upgrade() {
                c.handle_read(t);
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(c) = weak.upgrade() {
                c.handle_error();
            }
        });

        debug!(name = %conn.name, fd = conn.socket.fd(), "connection created");
        if let Err(e) = conn.socket.set_keep_alive(true) {
            warn!(name = %conn.name, error = %e, "SO_KEEPALIVE failed");
        }
        conn
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    #[must_use]
    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    #[must_use]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    /// The loop this connection is bound to, while it is alive.
    #[must_use]
    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.lock_cbs().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.lock_cbs().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.lock_cbs().write_complete = Some(cb);
    }

    /// Install the back-pressure callback, fired once per upward crossing
    /// of `mark` buffered output bytes.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.lock_cbs().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.lock_cbs().close = Some(cb);
    }

    /// Disable (or re-enable) Nagle's algorithm on this connection.
    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_no_delay(on) {
            warn!(name = %self.name, error = %e, "TCP_NODELAY failed");
        }
    }

    /// Attach arbitrary user state to the connection.
    pub fn set_context(&self, ctx: Box<dyn Any + Send>) {
        *self.lock_context() = Some(ctx);
    }

    /// Borrow the user context under the connection's lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.lock_context())
    }

    /// Send bytes, copying them if the call has to hop threads.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        let Some(lp) = self.owner.upgrade() else {
            return;
        };
        if lp.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let buf = Bytes::copy_from_slice(data);
            let Some(me) = self.self_weak.upgrade() else {
                return;
            };
            lp.run_in_loop(move || me.send_in_loop(&buf));
        }
    }

    /// Send a refcounted payload without copying, whichever thread calls.
    pub fn send_bytes(&self, data: Bytes) {
        if self.state() != ConnState::Connected {
            return;
        }
        let Some(lp) = self.owner.upgrade() else {
            return;
        };
        if lp.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let Some(me) = self.self_weak.upgrade() else {
                return;
            };
            lp.run_in_loop(move || me.send_in_loop(&data));
        }
    }

    /// Send everything currently readable in `buf`, consuming it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        let data = buf.retrieve_all_as_bytes();
        self.send_bytes(data);
    }

    /// Half-close: stop sending once the output buffer drains. Receiving
    /// continues until the peer closes its side.
    pub fn shutdown(&self) {
        let swapped = self.state.compare_exchange(
            ConnState::Connected as u8,
            ConnState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
                lp.run_in_loop(move || me.shutdown_in_loop());
            }
        }
    }

    /// Close now, discarding whatever is still buffered for write.
    pub fn force_close(&self) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.state
                .store(ConnState::Disconnecting as u8, Ordering::Release);
            if let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) {
                lp.queue_in_loop(move || me.force_close_in_loop());
            }
        }
    }

    /// Close after `delay`. The timer holds only a weak reference, so a
    /// pending delayed close never extends the connection's lifetime.
    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            if let Some(lp) = self.owner.upgrade() {
                let weak = self.self_weak.clone();
                lp.run_after(delay, move || {
                    if let Some(c) = weak.upgrade() {
                        c.force_close();
                    }
                });
            }
        }
    }

    /// Resume delivering read events (idempotent). Safe from any thread.
    pub fn start_read(&self) {
        let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        lp.run_in_loop(move || {
            if !me.reading.swap(true, Ordering::AcqRel) || !me.channel.is_reading() {
                me.channel.enable_reading();
            }
        });
    }

    /// Stop delivering read events (idempotent). Safe from any thread.
    pub fn stop_read(&self) {
        let (Some(lp), Some(me)) = (self.owner.upgrade(), self.self_weak.upgrade()) else {
            return;
        };
        lp.run_in_loop(move || {
            if me.reading.swap(false, Ordering::AcqRel) || me.channel.is_reading() {
                me.channel.disable_reading();
            }
        });
    }

    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Bytes currently queued for write.
    #[must_use]
    pub fn output_bytes(&self) -> usize {
        self.lock_output().readable_bytes()
    }

    /// Called by the owner on the loop thread once callbacks are wired:
    /// transitions to Connected, ties the channel, starts reading, and fires
    /// the connection callback.
    pub fn connect_established(&self) {
        self.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.state
            .store(ConnState::Connected as u8, Ordering::Release);
        let me = self.arc();
        let tie: Arc<dyn Any + Send + Sync> = me.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();
        if let Some(cb) = self.lock_cbs().connection.clone() {
            cb(&me);
        }
    }

    /// Final teardown on the loop thread; idempotent. Fires the connection
    /// callback with Disconnected if the close path has not already, then
    /// retires the channel.
    pub fn connect_destroyed(&self) {
        self.assert_in_loop_thread();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state() == ConnState::Connected {
            self.state
                .store(ConnState::Disconnected as u8, Ordering::Release);
            self.channel.disable_all();
            let me = self.arc();
            if let Some(cb) = self.lock_cbs().connection.clone() {
                cb(&me);
            }
        }
        // The channel was never registered if establishment never ran.
        if self.channel.is_added_to_loop() {
            self.channel.remove();
        }
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.assert_in_loop_thread();
        let mut input = self.lock_input();
        match input.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let me = self.arc();
                let cb = self.lock_cbs().message.clone();
                if let Some(cb) = cb {
                    // The input lock is held across the callback; the
                    // callback owns the buffer for its duration.
                    cb(&me, &mut input, receive_time);
                }
            }
            Err(e) => {
                drop(input);
                if e.raw_os_error() == Some(libc::EAGAIN) {
                    return;
                }
                error!(name = %self.name, error = %e, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }
        let mut output = self.lock_output();
        match sockets::write_fd(self.socket.fd(), output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.is_empty() {
                    drop(output);
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                if e.raw_os_error() != Some(libc::EAGAIN) {
                    error!(name = %self.name, error = %e, "write failed");
                }
            }
        }
    }

    fn handle_close(&self) {
        self.assert_in_loop_thread();
        let state = self.state();
        trace!(name = %self.name, ?state, "closing");
        assert!(matches!(
            state,
            ConnState::Connected | ConnState::Disconnecting
        ));
        // No further events; the owner unregisters us and queues destruction.
        self.state
            .store(ConnState::Disconnected as u8, Ordering::Release);
        self.channel.disable_all();

        let me = self.arc();
        let (conn_cb, close_cb) = {
            let cbs = self.lock_cbs();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = conn_cb {
            cb(&me);
        }
        if let Some(cb) = close_cb {
            cb(&me);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(e)) => e.to_string(),
            Ok(None) => "no pending error".to_string(),
            Err(e) => e.to_string(),
        };
        error!(name = %self.name, error = %err, "connection error");
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "disconnected, dropping write");
            return;
        }
        let mut wrote = 0usize;
        let mut fault = false;

        // Try the kernel directly when nothing is already queued.
        if !self.channel.is_writing() && self.lock_output().is_empty() {
            match sockets::write_fd(self.socket.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.raw_os_error() != Some(libc::EAGAIN) {
                        error!(name = %self.name, error = %e, "write failed");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE | libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let hwm_cb = {
                let mut output = self.lock_output();
                let old_len = output.readable_bytes();
                let mark = self.high_water_mark.load(Ordering::Acquire);
                let crossed = old_len + remaining >= mark && old_len < mark;
                output.append(&data[wrote..]);
                if crossed {
                    self.lock_cbs()
                        .high_water_mark
                        .clone()
                        .map(|cb| (cb, old_len + remaining))
                } else {
                    None
                }
            };
            if let Some((cb, len)) = hwm_cb {
                let me = self.arc();
                if let Some(lp) = self.owner.upgrade() {
                    lp.queue_in_loop(move || cb(&me, len));
                }
            }
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn force_close_in_loop(&self) {
        self.assert_in_loop_thread();
        if matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.handle_close();
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.lock_cbs().write_complete.clone();
        if let Some(cb) = cb {
            let me = self.arc();
            if let Some(lp) = self.owner.upgrade() {
                lp.queue_in_loop(move || cb(&me));
            }
        }
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .upgrade()
            .expect("connection used after destruction")
    }

    fn assert_in_loop_thread(&self) {
        if let Some(lp) = self.owner.upgrade() {
            lp.assert_in_loop_thread();
        }
    }

    fn lock_cbs(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_input(&self) -> MutexGuard<'_, Buffer> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_output(&self) -> MutexGuard<'_, Buffer> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}

/// Fallback connection callback: log the transition and move on.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    debug!(
        local = %conn.local_addr(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state changed"
    );
}

/// Fallback message callback: discard everything so an un-wired connection
/// cannot grow its input buffer without bound.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _t: Timestamp) {
    buf.retrieve_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(s as u8), s);
        }
    }
}
