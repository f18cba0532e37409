//! # Keelson
//!
//! A thread-per-reactor TCP networking library.
//!
//! ## Architecture
//!
//! Keelson is structured as a small stack with clean layering:
//!
//! - **`keelson-core`**: byte buffers, addressing, socket helpers, monotonic
//!   time — no event loop in sight
//! - **`keelson-net`**: the reactor (event loop, pollers, timers) and the
//!   TCP connection/server/client machinery
//! - **`keelson`**: public API surface (this crate)
//!
//! ## Model
//!
//! One `EventLoop` per thread waits for OS readiness and runs callbacks.
//! A `TcpServer` accepts on one loop and spreads connections across a pool
//! of worker loops; a `TcpClient` keeps one connection alive with
//! exponential-backoff reconnects. All callbacks for a connection run on the
//! loop thread that owns it; work from other threads funnels through the
//! loop's task queue.
//!
//! ## Quick start
//!
//! An echo server:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keelson::{EventLoop, TcpServer};
//! use keelson::InetAddr;
//!
//! let addr: InetAddr = "127.0.0.1:7000".parse()?;
//! let lp = EventLoop::new();
//! let server = TcpServer::new(&lp, &addr, "echo", false)?;
//! server.set_thread_num(2);
//! server.set_message_callback(Arc::new(|conn, buf, _when| {
//!     let bytes = buf.retrieve_all_as_bytes();
//!     conn.send_bytes(bytes);
//! }));
//! server.start();
//! lp.run();
//! # Ok::<(), keelson::KeelsonError>(())
//! ```

pub mod dev_tracing;

pub use keelson_core::addr::{AddrError, InetAddr};
pub use keelson_core::buffer::Buffer;
pub use keelson_core::error::{KeelsonError, Result};
pub use keelson_core::sockets::Socket;
pub use keelson_core::time::Timestamp;

pub use keelson_net::{
    Channel, ConnState, ConnectionCallback, EventLoop, EventLoopThread, EventLoopThreadPool,
    HighWaterMarkCallback, MessageCallback, TcpClient, TcpConnection, TcpServer,
    ThreadInitCallback, TimerId, WriteCompleteCallback,
};
