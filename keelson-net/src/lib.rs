//! Keelson Net
//!
//! A thread-per-reactor TCP networking library. Each [`EventLoop`] is a
//! single-threaded demultiplexer: it waits on a poller backend for
//! readiness, dispatches ready [`Channel`]s to their callbacks, fires due
//! timers, and drains tasks posted from other threads. [`TcpServer`] owns a
//! listening socket on one loop and spreads accepted connections over an
//! [`EventLoopThreadPool`]; [`TcpClient`] drives a non-blocking connect with
//! exponential backoff and owns at most one connection.
//!
//! ## Threading rules
//!
//! Every mutation of a loop, its channels, its timers, or a connection bound
//! to it happens on the thread that constructed the loop. Calls from other
//! threads funnel through [`EventLoop::run_in_loop`]; user callbacks always
//! run on the owning loop thread and must not block it. Violations of the
//! thread pin are contract bugs and abort the process with a diagnostic.

// Raw syscall surface (epoll/poll/eventfd/timerfd) is confined to the
// modules that opt back in.
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod acceptor;
pub mod callbacks;
pub mod channel;
pub mod client;
pub mod connection;
pub mod connector;
pub mod event_loop;
pub mod server;
pub mod thread_pool;
pub mod timer;

mod poller;
mod timer_queue;

pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback,
    WriteCompleteCallback,
};
pub use channel::Channel;
pub use client::TcpClient;
pub use connection::{ConnState, TcpConnection};
pub use event_loop::EventLoop;
pub use server::TcpServer;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool};
pub use timer::TimerId;
