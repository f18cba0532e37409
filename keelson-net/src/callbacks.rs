//! Callback signatures shared across the library.
//!
//! Callbacks are `Arc<dyn Fn>` so an owner can hand the same callback to
//! many connections, and so a channel can clone the callback out of its
//! lock before invoking it (callbacks are free to re-enter the channel).

use std::sync::Arc;

use keelson_core::addr::InetAddr;
use keelson_core::buffer::Buffer;
use keelson_core::sockets::Socket;
use keelson_core::time::Timestamp;

use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;

/// Fired when a connection reaches Connected and again when it reaches
/// Disconnected; `conn.connected()` distinguishes the two.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired on the loop thread whenever bytes arrive. The callback consumes
/// what it can parse from the buffer and leaves the rest for the next call.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired once per upward crossing of the output-buffer high-water mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal: lets the owning server/client unregister a closing connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Run on each freshly spawned loop thread before it starts polling.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Internal: the acceptor publishes `(socket, peer)` pairs through this.
pub(crate) type NewConnectionCallback = Arc<dyn Fn(Socket, InetAddr) + Send + Sync>;

/// Internal: the connector publishes the connected socket through this.
pub(crate) type ConnectorCallback = Arc<dyn Fn(Socket) + Send + Sync>;
