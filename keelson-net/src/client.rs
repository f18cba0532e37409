//! TCP client composition.
//!
//! A `TcpClient` owns one connector and at most one live connection.
//! `connect` starts the backoff-driven connect machinery; a successful
//! connect wraps the socket in a `TcpConnection` on the owning loop. When
//! the connection closes, the client forgets it and, with retry enabled,
//! restarts the connector from the initial delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keelson_core::addr::InetAddr;
use keelson_core::sockets::Socket;
use tracing::{debug, info, warn};

use crate::callbacks::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
use crate::connection::{
    default_connection_callback, default_message_callback, TcpConnection,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;

struct ClientCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

pub struct TcpClient {
    owner: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    self_weak: Weak<TcpClient>,
    /// Reconnect after an established connection drops.
    retry: AtomicBool,
    /// Whether the user currently wants a connection.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    callbacks: Mutex<ClientCallbacks>,
}

impl TcpClient {
    pub fn new(lp: &Arc<EventLoop>, server_addr: InetAddr, name: impl Into<String>) -> Arc<Self> {
        let client = Arc::new_cyclic(|self_weak: &Weak<TcpClient>| Self {
            owner: lp.clone(),
            connector: Connector::new(lp, server_addr),
            name: name.into(),
            self_weak: self_weak.clone(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connection: Mutex::new(None),
            callbacks: Mutex::new(ClientCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
            }),
        });
        let weak = client.self_weak.clone();
        client
            .connector
            .set_new_connection_callback(Arc::new(move |sock| {
                if let Some(c) = weak.upgrade() {
                    c.new_connection(sock);
                }
            }));
        client
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn server_addr(&self) -> InetAddr {
        self.connector.server_addr()
    }

    /// The live connection, if one is established.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.lock_connection().clone()
    }

    /// Reconnect automatically when an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.lock_cbs().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.lock_cbs().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.lock_cbs().write_complete = Some(cb);
    }

    /// Start connecting (with exponential backoff on failure).
    pub fn connect(&self) {
        info!(name = %self.name, server = %self.connector.server_addr(), "connecting");
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Half-close the established connection, if any.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.lock_connection().clone() {
            conn.shutdown();
        }
    }

    /// Cancel in-flight connect attempts without touching an established
    /// connection.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, sock: Socket) {
        self.owner.assert_in_loop_thread();
        let (local, peer) = match (sock.local_addr(), sock.peer_addr()) {
            (Ok(l), Ok(p)) => (l, p),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "getsockname/getpeername failed, dropping connect");
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}:{}#{id}", self.name, peer);
        let conn = TcpConnection::new(&self.owner, conn_name, sock, local, peer);
        {
            let cbs = self.lock_cbs();
            conn.set_connection_callback(cbs.connection.clone());
            conn.set_message_callback(cbs.message.clone());
            if let Some(cb) = &cbs.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(c);
            }
        }));
        *self.lock_connection() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.owner.assert_in_loop_thread();
        {
            let mut cur = self.lock_connection();
            debug_assert!(cur.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)));
            *cur = None;
        }
        let conn = conn.clone();
        self.owner.queue_in_loop(move || conn.connect_destroyed());
        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(name = %self.name, server = %self.connector.server_addr(), "reconnecting");
            self.connector.restart();
        }
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<TcpConnection>>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cbs(&self) -> MutexGuard<'_, ClientCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!(name = %self.name, "client destroyed");
        let conn = self.lock_connection().take();
        if let Some(conn) = conn {
            // The connection may outlive us; reroute its close path straight
            // to teardown on its own loop.
            conn.set_close_callback(Arc::new(|c| {
                if let Some(lp) = c.owner_loop() {
                    let c = c.clone();
                    lp.queue_in_loop(move || c.connect_destroyed());
                }
            }));
            if Arc::strong_count(&conn) == 1 {
                conn.force_close();
            }
        } else {
            self.connector.stop();
        }
    }
}
