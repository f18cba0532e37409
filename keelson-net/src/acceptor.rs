//! Server-side half-connection manager.
//!
//! Owns the non-blocking listening socket and its channel; on readability it
//! accepts one pending connection and publishes `(socket, peer)` to the new
//! connection callback. One spare descriptor (`/dev/null`) is reserved at
//! construction to survive `EMFILE`: closing it frees a slot to accept and
//! immediately drop the pending connection, so a level-triggered listen
//! socket cannot spin the loop while the process is out of descriptors.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keelson_core::addr::InetAddr;
use keelson_core::sockets::Socket;
use tracing::{error, trace, warn};

use crate::callbacks::NewConnectionCallback;
use crate::channel::Channel;
use crate::event_loop::EventLoop;

struct Inner {
    new_connection_cb: Option<NewConnectionCallback>,
    listening: bool,
    /// EMFILE reserve. Never registered with the poller.
    idle_fd: Option<OwnedFd>,
}

pub struct Acceptor {
    owner: Weak<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    inner: Mutex<Inner>,
}

impl Acceptor {
    pub fn new(
        lp: &Arc<EventLoop>,
        listen_addr: &InetAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let socket = Socket::new_nonblocking(listen_addr.is_ipv6())?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;
        let idle_fd = open_idle_fd()?;

        let acceptor = Arc::new(Self {
            owner: Arc::downgrade(lp),
            channel: Channel::new(Arc::downgrade(lp), socket.fd()),
            socket,
            inner: Mutex::new(Inner {
                new_connection_cb: None,
                listening: false,
                idle_fd: Some(idle_fd),
            }),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(a) = weak.upgrade() {
                a.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        self.lock().new_connection_cb = Some(cb);
    }

    /// Start listening and watching for readability. Loop thread only; a
    /// listen failure at this point is an environment error with no sane
    /// recovery, so it aborts.
    pub fn listen(&self) {
        self.assert_in_loop_thread();
        self.lock().listening = true;
        if let Err(e) = self.socket.listen() {
            panic!("listen on {:?} failed: {e}", self.socket.local_addr());
        }
        self.channel.enable_reading();
    }

    #[must_use]
    pub fn listening(&self) -> bool {
        self.lock().listening
    }

    /// Actual bound address (useful after a port-0 bind).
    pub fn local_addr(&self) -> io::Result<InetAddr> {
        self.socket.local_addr()
    }

    fn handle_read(&self) {
        self.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((sock, peer)) => {
                trace!(peer = %peer, "accepted connection");
                let cb = self.lock().new_connection_cb.clone();
                if let Some(cb) = cb {
                    cb(sock, peer);
                } else {
                    // Nobody wants it; drop closes the descriptor.
                    drop(sock);
                }
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN | libc::EINTR) => {}
                Some(libc::EMFILE) => {
                    error!("accept hit EMFILE, draining via reserved fd");
                    self.drain_with_idle_fd();
                }
                _ => error!(error = %e, "accept failed"),
            },
        }
    }

    /// Give the EMFILE slot back, accept-and-close the pending connection,
    /// then re-reserve. The listening channel stays registered throughout.
    fn drain_with_idle_fd(&self) {
        let mut inner = self.lock();
        let Some(spare) = inner.idle_fd.take() else {
            warn!("EMFILE with no reserve descriptor");
            return;
        };
        // Closing the spare frees exactly one slot for the drain accept.
        drop(spare);
        let fd = unsafe { libc::accept(self.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        match open_idle_fd() {
            Ok(idle) => inner.idle_fd = Some(idle),
            Err(e) => error!(error = %e, "could not re-reserve idle fd"),
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

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Unregister on the owning loop if it is still alive. The channel
        // holds no strong reference back, so this cannot cycle.
        if let Some(lp) = self.owner.upgrade() {
            let channel = self.channel.clone();
            lp.run_in_loop(move || {
                channel.disable_all();
                channel.remove();
            });
        }
    }
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
