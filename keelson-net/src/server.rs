//! TCP server composition.
//!
//! A `TcpServer` owns an acceptor on the loop it was built with (the
//! "accept loop") and a pool of worker loops. Each accepted connection is
//! named, bound round-robin to a worker, stored in the accept-loop-owned
//! connection map, and established on its worker. The close path funnels
//! back to the accept loop for map maintenance, then queues final teardown
//! on the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keelson_core::addr::InetAddr;
use keelson_core::error::Result;
use keelson_core::sockets::Socket;
use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::{
    default_connection_callback, default_message_callback, TcpConnection,
};
use crate::event_loop::EventLoop;
use crate::thread_pool::EventLoopThreadPool;

struct ServerCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

pub struct TcpServer {
    accept_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    self_weak: Weak<TcpServer>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    callbacks: Mutex<ServerCallbacks>,
}

impl TcpServer {
    /// Bind `listen_addr` on the given accept loop. The socket listens only
    /// once [`TcpServer::start`] runs.
    pub fn new(
        lp: &Arc<EventLoop>,
        listen_addr: &InetAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let acceptor = Acceptor::new(lp, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.ip_port();

        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer>| Self {
            accept_loop: lp.clone(),
            pool: EventLoopThreadPool::new(lp.clone(), name.clone()),
            name,
            ip_port,
            acceptor,
            self_weak: self_weak.clone(),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(ServerCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                thread_init: None,
            }),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Arc::new(move |sock, peer| {
                if let Some(s) = weak.upgrade() {
                    s.new_connection(sock, peer);
                }
            }));
        Ok(server)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"ip:port"` the server is bound to.
    #[must_use]
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// Actual bound address (resolves a port-0 bind).
    pub fn listen_addr(&self) -> Result<InetAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    #[must_use]
    pub fn accept_loop(&self) -> &Arc<EventLoop> {
        &self.accept_loop
    }

    /// Number of worker loops; zero handles connections on the accept loop.
    /// Call before `start`.
    pub fn set_thread_num(&self, n: usize) {
        self.pool.set_thread_num(n);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.lock_cbs().thread_init = Some(cb);
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

    /// Start the worker pool and begin listening. Idempotent; must run on
    /// the accept loop thread (funnel through `run_in_loop` otherwise).
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let init = self.lock_cbs().thread_init.clone();
        self.pool.start(init);
        assert!(!self.acceptor.listening());
        info!(name = %self.name, addr = %self.ip_port, "server starting");
        let acceptor = self.acceptor.clone();
        self.accept_loop.run_in_loop(move || acceptor.listen());
    }

    fn new_connection(&self, sock: Socket, peer: InetAddr) {
        self.accept_loop.assert_in_loop_thread();
        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{id}", self.name, self.ip_port);
        info!(name = %conn_name, peer = %peer, "new connection");

        let local = match sock.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "getsockname failed, dropping connection");
                return;
            }
        };

        let conn = TcpConnection::new(&io_loop, conn_name.clone(), sock, local, peer);
        self.lock_connections().insert(conn_name, conn.clone());
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
            if let Some(s) = weak.upgrade() {
                s.remove_connection(c);
            }
        }));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's worker loop; hop to the accept loop for the
    /// map, then back to the worker for teardown.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let Some(server) = self.self_weak.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.accept_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.accept_loop.assert_in_loop_thread();
        debug!(name = %self.name, conn = %conn.name(), "removing connection");
        self.lock_connections().remove(conn.name());
        if let Some(io_loop) = conn.owner_loop() {
            let conn = conn.clone();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }

    /// Connections currently tracked (accept-loop map size).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Arc<TcpConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cbs(&self) -> MutexGuard<'_, ServerCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!(name = %self.name, "server destroyed");
        for (_, conn) in self.lock_connections().drain() {
            if let Some(io_loop) = conn.owner_loop() {
                io_loop.run_in_loop(move || conn.connect_destroyed());
            }
        }
    }
}
