//! Growable byte queue used for per-connection input and output.
//!
//! The storage is split into three regions:
//!
//! ```text
//! | prependable       | readable            | writable             |
//! 0               read_pos             write_pos              capacity
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so a small header can be
//! written in front of already-queued data without shifting it. Consuming
//! everything resets both positions back to the reserve, and
//! `ensure_writable` compacts consumed space before it grows the storage.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved space in front of the readable region.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// A byte queue with a cheap prepend region and fd-oriented I/O helpers.
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `initial` bytes of writable space.
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            data: vec![0u8; CHEAP_PREPEND + initial],
            read_pos: CHEAP_PREPEND,
            write_pos: CHEAP_PREPEND,
        }
    }

    /// Number of bytes queued for reading.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be appended without reallocating.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Space in front of the readable region (reserve plus consumed bytes).
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Total storage size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consume `len` bytes. Consuming everything resets both positions to
    /// the prepend reserve.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_pos += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume everything and reset the positions.
    pub fn retrieve_all(&mut self) {
        self.read_pos = CHEAP_PREPEND;
        self.write_pos = CHEAP_PREPEND;
    }

    /// Consume up to `len` bytes and return them as a string (lossy UTF-8).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    /// Consume the whole readable region as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append bytes at the write position, growing storage if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Write bytes into the prepend region, directly in front of the
    /// readable data.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than the prependable space.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds prependable space ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.read_pos -= data.len();
        self.data[self.read_pos..self.read_pos + data.len()].copy_from_slice(data);
    }

    /// Make sure at least `len` bytes are writable.
    ///
    /// Prefers reclaiming consumed prependable space (moving the readable
    /// region down to the reserve) over growing the storage.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, CHEAP_PREPEND);
            self.read_pos = CHEAP_PREPEND;
            self.write_pos = self.read_pos + readable;
        }
    }

    /// Read from `fd` into the buffer with a single scattered read.
    ///
    /// The second segment is a 64 KiB stack buffer, so one syscall makes at
    /// least that much progress even when the writable region is small; the
    /// overflow is appended afterwards. Readiness is level-triggered, so any
    /// bytes left in the socket re-fire the next poll.
    ///
    /// Returns `Ok(0)` on EOF. EAGAIN surfaces as
    /// `io::ErrorKind::WouldBlock` and is not an error at this layer.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write_pos) }
                    as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`.
    ///
    /// Does not consume; the caller calls [`retrieve`](Self::retrieve) with
    /// the number of bytes actually written.
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                fd,
                self.data.as_ptr().add(self.read_pos) as *const libc::c_void,
                self.readable_bytes(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
