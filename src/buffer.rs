//! A growable byte buffer with prepend/readable/writable windows and a
//! scatter-read fast path, the buffer every [`TcpConnection`](crate::net::TcpConnection)
//! uses for both its input and output sides.

use std::io::{self, IoSliceMut};
use std::os::fd::RawFd;

/// Bytes reserved at the front of every buffer for callers that want to
/// prepend a length header after the payload has already been appended.
pub const PREPEND_SIZE: usize = 8;
const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

/// `[0, read)` prependable, `[read, write)` readable, `[write, len)` writable.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            storage: vec![0u8; INITIAL_SIZE],
            read_index: PREPEND_SIZE,
            write_index: PREPEND_SIZE,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn prependable(&self) -> usize {
        self.read_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// The readable window, unconsumed.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Advances the read index past `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable());
        if len < self.readable() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Resets both indices to the prepend reserve, discarding all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.read_index = PREPEND_SIZE;
        self.write_index = PREPEND_SIZE;
    }

    /// Retrieves up to (and including, if found) the byte at `upto`, as an owned `Vec`.
    pub fn retrieve_until(&mut self, upto: usize) -> Vec<u8> {
        assert!(upto <= self.write_index);
        assert!(upto >= self.read_index);
        let bytes = self.storage[self.read_index..upto].to_vec();
        self.read_index = upto;
        if self.read_index == self.write_index {
            self.retrieve_all();
        }
        bytes
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable();
        let bytes = self.peek().to_vec();
        self.retrieve(n);
        bytes
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    pub fn append_u8(&mut self, value: u8) {
        self.append(&[value]);
    }

    pub fn append_u16(&mut self, value: u16) {
        self.append(&value.to_be_bytes());
    }

    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    pub fn append_u64(&mut self, value: u64) {
        self.append(&value.to_be_bytes());
    }

    pub fn peek_u8(&self) -> u8 {
        self.peek()[0]
    }

    pub fn peek_u16(&self) -> u16 {
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_u32(&self) -> u32 {
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_u64(&self) -> u64 {
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    /// Ensures at least `len` writable bytes, compacting or growing as needed.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable() >= len {
            return;
        }

        if self.prependable() - PREPEND_SIZE + self.writable() >= len {
            // Compact: slide the readable window left to the prepend reserve.
            let readable = self.readable();
            self.storage
                .copy_within(self.read_index..self.write_index, PREPEND_SIZE);
            self.read_index = PREPEND_SIZE;
            self.write_index = PREPEND_SIZE + readable;
        } else {
            self.storage.resize(self.write_index + len, 0);
        }
    }

    /// Finds the first `\r\n` in the readable window.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek()
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| self.read_index + pos)
    }

    /// Finds the first `\n` in the readable window.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek()
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| self.read_index + pos)
    }

    /// Scatter-reads from `fd` into the writable window plus a stack-sized
    /// overflow buffer, appending anything that didn't fit directly.
    /// Returns `(bytes_read, saved_errno)`; `bytes_read == 0` means EOF,
    /// negative `bytes_read` (as `-1`) means error with `saved_errno` set.
    pub fn read_fd(&mut self, fd: RawFd) -> (isize, i32) {
        let writable = self.writable();
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];

        let write_index = self.write_index;
        let (head, tail) = self.storage.split_at_mut(write_index);
        let _ = head;

        let mut iovecs = [
            IoSliceMut::new(tail),
            IoSliceMut::new(&mut extra_buf),
        ];
        let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe {
            libc::readv(
                fd,
                iovecs.as_mut_ptr() as *const libc::iovec,
                iovcnt as libc::c_int,
            )
        };

        if n < 0 {
            return (-1, io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }

        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            let overflow = n - writable;
            self.append(&extra_buf[..overflow]);
        }

        (n as isize, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn initial_layout_matches_prepend_reserve() {
        let buf = Buffer::new();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable(), PREPEND_SIZE);
        assert_eq!(buf.writable(), INITIAL_SIZE - PREPEND_SIZE);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(buf.peek(), b"hello");
        let out = buf.retrieve_all_as_vec();
        assert_eq!(out, b"hello");
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable(), PREPEND_SIZE);
    }

    #[test]
    fn retrieve_full_resets_to_prepend_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.read_index, PREPEND_SIZE);
        assert_eq!(buf.write_index, PREPEND_SIZE);
    }

    #[test]
    fn partial_retrieve_then_append_preserves_readable_content() {
        let mut buf = Buffer::new();
        buf.append(b"0123456789");
        buf.retrieve(5);
        assert_eq!(buf.peek(), b"56789");
        buf.append(b"X");
        assert_eq!(buf.peek(), b"56789X");
    }

    #[test]
    fn growth_preserves_readable_bytes_when_compaction_is_insufficient() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 10]);
        let big = vec![b'b'; 10_000];
        buf.append(&big);
        assert_eq!(buf.readable(), 10 + 10_000);
        assert_eq!(&buf.peek()[..10], &vec![b'a'; 10][..]);
    }

    #[test]
    fn big_endian_round_trip() {
        let mut buf = Buffer::new();
        buf.append_u32(0x01020304);
        assert_eq!(buf.peek(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(buf.peek_u32(), 0x01020304);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\n");
        let crlf = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..crlf - buf.read_index], b"GET / HTTP/1.1");
        assert!(buf.find_eol().is_some());
    }

    #[test]
    fn read_fd_pulls_from_a_pipe() {
        let (r, w) = unix_pipe();
        let mut buf = Buffer::new();
        let payload = b"the quick brown fox";
        unsafe {
            libc::write(
                w.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            );
        }
        let (n, errno) = buf.read_fd(r.as_raw_fd());
        assert_eq!(errno, 0);
        assert_eq!(n as usize, payload.len());
        assert_eq!(buf.peek(), payload);
    }

    fn unix_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::fd::FromRawFd;
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }
}
