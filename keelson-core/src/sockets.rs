//! Non-blocking TCP socket creation and raw-fd helpers.
//!
//! The reactor deals in readiness notifications, so every socket here is
//! created non-blocking and close-on-exec. [`Socket`] owns a descriptor for
//! its whole lifetime and closes it exactly once on drop; channels and
//! pollers only ever borrow the raw fd.
//!
//! # Safety
//!
//! This module uses unsafe code for the syscalls `socket2` does not model
//! (`accept4`, raw `write`). The unsafe operations are encapsulated and safe
//! to use from the public API.

#![allow(unsafe_code)]

use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use socket2::{Domain, Protocol, Type};
use tracing::warn;

use crate::addr::InetAddr;

/// RAII wrapper around a non-blocking TCP socket descriptor.
///
/// Closing belongs here and nowhere else: the channel that watches the fd
/// and the poller that registers it never own it.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a fresh non-blocking, close-on-exec TCP socket.
    pub fn new_nonblocking(ipv6: bool) -> io::Result<Self> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let inner = socket2::Socket::new(
            domain,
            Type::STREAM.nonblocking().cloexec(),
            Some(Protocol::TCP),
        )?;
        Ok(Self { inner })
    }

    /// Adopt an already-connected descriptor (from `accept4`).
    ///
    /// # Safety-adjacent contract
    ///
    /// `fd` must be an open socket descriptor owned by nobody else.
    fn from_accepted(fd: RawFd) -> Self {
        Self {
            // SAFETY: accept4 just handed us this fd; ownership transfers here.
            inner: unsafe { socket2::Socket::from_raw_fd(fd) },
        }
    }

    #[inline]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        self.inner.bind(&addr.to_sock_addr())
    }

    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Initiate a non-blocking connect.
    ///
    /// Returns the raw error so callers can distinguish `EINPROGRESS` (the
    /// normal non-blocking outcome) from genuine failures.
    pub fn connect(&self, addr: &InetAddr) -> io::Result<()> {
        self.inner.connect(&addr.to_sock_addr())
    }

    /// Accept one pending connection.
    ///
    /// The returned socket is non-blocking and close-on-exec regardless of
    /// the listening socket's flags.
    pub fn accept(&self) -> io::Result<(Socket, InetAddr)> {
        let fd = unsafe {
            libc::accept4(
                self.fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self::from_accepted(fd);
        let peer = sock.peer_addr()?;
        Ok((sock, peer))
    }

    /// Close the writing half, letting queued inbound data drain.
    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            warn!(fd = self.fd(), error = %e, "shutdown_write failed");
        }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    /// Disable (or re-enable) Nagle's algorithm.
    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    /// Pending `SO_ERROR`, cleared by reading it.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn local_addr(&self) -> io::Result<InetAddr> {
        sockaddr_to_inet(self.inner.local_addr()?)
    }

    pub fn peer_addr(&self) -> io::Result<InetAddr> {
        sockaddr_to_inet(self.inner.peer_addr()?)
    }

    /// A connect that landed on its own ephemeral port.
    ///
    /// Possible when connecting to a local port inside the ephemeral range;
    /// such a connection talks to itself and must be treated as a failure.
    #[must_use]
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }
}

fn sockaddr_to_inet(sa: socket2::SockAddr) -> io::Result<InetAddr> {
    sa.as_socket().map(InetAddr::from).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "socket address is not inet")
    })
}

/// Plain `write(2)` on a raw fd.
///
/// Short writes and `EWOULDBLOCK` are the caller's business; the reactor
/// buffers the remainder and waits for write readiness.
pub fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
