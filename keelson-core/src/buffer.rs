//! Contiguous input/output byte buffer.
//!
//! Every TCP connection owns two of these: bytes read from the socket are
//! appended to the input buffer and handed to the message callback (which
//! consumes what it can parse and leaves the rest), and bytes the kernel
//! would not take synchronously wait in the output buffer until the next
//! write-readiness notification.
//!
//! The buffer is backed by `bytes::BytesMut`, so `peek` is always a single
//! contiguous slice and `retrieve` is an index bump. [`Buffer::read_fd`]
//! performs a scatter read into the buffer's spare capacity plus a 64 KiB
//! stack slab, which bounds how fast an idle connection's buffer grows while
//! still draining large bursts in one syscall.

#![allow(unsafe_code)]

use std::io;
use std::os::unix::io::RawFd;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Spill slab size for [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

/// Initial spare capacity reserved before a scatter read.
const READ_RESERVE: usize = 4096;

/// Growable contiguous byte buffer with O(1) consume-from-front.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of bytes available to read.
    #[inline]
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The readable bytes as one contiguous slice.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.inner
    }

    /// Append bytes at the write end.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// Consume `n` bytes from the read end.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.readable_bytes()`.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        self.inner.advance(n);
    }

    /// Consume everything.
    pub fn retrieve_all(&mut self) {
        self.inner.clear();
    }

    /// Take the first `n` bytes out as a refcounted `Bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.readable_bytes()`.
    #[must_use]
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Bytes {
        assert!(n <= self.readable_bytes());
        self.inner.split_to(n).freeze()
    }

    /// Take everything out as a refcounted `Bytes`.
    #[must_use]
    pub fn retrieve_all_as_bytes(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    /// Consume the first `n` bytes and return them as a `String`.
    ///
    /// Invalid UTF-8 is replaced, not rejected; wire data is untrusted.
    #[must_use]
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        let bytes = self.retrieve_as_bytes(n);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Consume everything and return it as a `String`.
    #[must_use]
    pub fn retrieve_all_as_string(&mut self) -> String {
        let n = self.readable_bytes();
        self.retrieve_as_string(n)
    }

    /// Offset of the first `\r\n` in the readable bytes, if any.
    #[must_use]
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Scatter-read from `fd` into the buffer.
    ///
    /// Reads into the buffer's spare capacity and a stack slab in one
    /// `readv`; whatever landed in the slab is appended afterwards. Returns
    /// the byte count from the kernel (`0` means the peer closed its write
    /// side).
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        self.inner.reserve(READ_RESERVE);

        let (ptr, writable) = {
            let chunk = self.inner.chunk_mut();
            (chunk.as_mut_ptr(), chunk.len())
        };
        let mut iov = [
            libc::iovec {
                iov_base: ptr.cast::<libc::c_void>(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: extra.len(),
            },
        ];
        // Skip the slab once the buffer itself has room for a full burst.
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            // SAFETY: the kernel initialized exactly `n` bytes of the chunk.
            unsafe { self.inner.advance_mut(n) };
        } else {
            // SAFETY: the kernel filled the whole chunk before spilling.
            unsafe { self.inner.advance_mut(writable) };
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_append_peek_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        buf.retrieve_all();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_retrieve_as_string() {
        let mut buf = Buffer::new();
        buf.append(b"ping/pong");
        assert_eq!(buf.retrieve_as_string(4), "ping");
        assert_eq!(buf.retrieve_all_as_string(), "/pong");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_retrieve_as_bytes_keeps_rest() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        let head = buf.retrieve_as_bytes(3);
        assert_eq!(&head[..], b"abc");
        assert_eq!(buf.peek(), b"def");
    }

    #[test]
    fn test_find_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        buf.retrieve(16);
        assert_eq!(buf.find_crlf(), Some(7));
        buf.retrieve_all();
        assert_eq!(buf.find_crlf(), None);
    }

    #[test]
    #[should_panic(expected = "n <= self.readable_bytes()")]
    fn test_retrieve_past_end_panics() {
        let mut buf = Buffer::new();
        buf.append(b"x");
        buf.retrieve(2);
    }

    #[test]
    fn test_read_fd_small() {
        let mut file = tempfile();
        file.write_all(b"scatter me").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(file.as_raw_fd()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buf.peek(), b"scatter me");
    }

    #[test]
    fn test_read_fd_spills_into_extra_slab() {
        // Larger than the reserved chunk, so part of the read lands in the
        // stack slab and must be appended afterwards.
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile();
        file.write_all(&payload).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = Buffer::new();
        let mut total = 0;
        while total < payload.len() {
            let n = buf.read_fd(file.as_raw_fd()).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
    }

    fn tempfile() -> std::fs::File {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "keelson-buffer-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
