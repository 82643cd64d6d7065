// Copyright 2024 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Growable byte buffer with split read/write cursors
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=  writer_index    <=   capacity
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved so small length headers
//! can be inserted in front of queued data without copying it.

use std::io;
use std::os::fd::RawFd;

/// Space reserved in front of the read cursor for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// A contiguous, growable byte buffer with independent read and write
/// cursors. Retrieving every readable byte resets both cursors to the
/// cheap-prepend offset so the space is reused instead of growing.
#[derive(Debug, Clone)]
pub struct Buffer {
    buffer: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with [`INITIAL_SIZE`] writable bytes.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `initial` writable bytes.
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            buffer: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Total capacity, including the prependable region.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be written without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buffer.len() - self.writer_index
    }

    /// Number of bytes in front of the read cursor.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buffer[self.reader_index..self.writer_index]
    }

    /// Offset, relative to the read cursor, of the first CRLF in the
    /// readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Like [`Buffer::find_crlf`], scanning from `start` (an offset into
    /// the readable region).
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| start + pos)
    }

    /// Offset, relative to the read cursor, of the first LF in the readable
    /// region.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    /// Like [`Buffer::find_eol`], scanning from `start`.
    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    /// Consumes `len` readable bytes. Consuming everything resets both
    /// cursors to the cheap-prepend offset.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes readable bytes up to `end`, an offset from the read cursor.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Consumes every readable byte.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` readable bytes, returning them.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Consumes every readable byte, returning them.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        let len = self.readable_bytes();
        self.retrieve_as_bytes(len)
    }

    /// Consumes `len` readable bytes as a string, replacing invalid UTF-8.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    /// Consumes every readable byte as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let len = self.readable_bytes();
        self.retrieve_as_string(len)
    }

    /// Appends bytes after the write cursor, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buffer[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Guarantees at least `len` writable bytes, compacting or growing per
    /// the policy below.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// The writable region. Call [`Buffer::has_written`] after filling it.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let writer = self.writer_index;
        &mut self.buffer[writer..]
    }

    /// Advances the write cursor after external code filled the writable
    /// region.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Moves the write cursor back, discarding the last `len` readable
    /// bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Inserts bytes immediately in front of the read cursor.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let reader = self.reader_index;
        self.buffer[reader..reader + data.len()].copy_from_slice(data);
    }

    /// Discards excess capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut buffer = vec![0; CHEAP_PREPEND + readable + reserve];
        buffer[CHEAP_PREPEND..CHEAP_PREPEND + readable].copy_from_slice(self.peek());
        self.buffer = buffer;
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND + readable;
    }

    /// Swaps contents with another buffer.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    /// Reads from `fd` with a scatter read: the first vector is the
    /// writable region, the second a 64 KiB stack scratch. When the kernel
    /// fills past the writable region the scratch portion is appended, so a
    /// single syscall can absorb large payloads without pre-sizing.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();
        let writer = self.writer_index;

        let mut iov = [
            libc::iovec {
                iov_base: self.buffer[writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        // Only fall back to the scratch when the writable region is smaller
        // than it; otherwise one vector suffices.
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buffer.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Grows or compacts so that `len` bytes fit after the write cursor.
    ///
    /// When the writable and prependable regions together can hold the
    /// request (plus the cheap-prepend reserve), readable bytes are copied
    /// left instead of reallocating.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buffer.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buffer
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn regions_sum_to_capacity(buf: &Buffer) -> bool {
        buf.prependable_bytes() + buf.readable_bytes() + buf.writable_bytes() == buf.capacity()
    }

    #[test]
    fn fresh_buffer_has_expected_regions() {
        let buf = Buffer::new();
        assert_eq!(0, buf.readable_bytes());
        assert_eq!(INITIAL_SIZE, buf.writable_bytes());
        assert_eq!(CHEAP_PREPEND, buf.prependable_bytes());
        assert!(regions_sum_to_capacity(&buf));
    }

    #[test]
    fn append_then_retrieve_all_is_identity() {
        let mut buf = Buffer::new();
        buf.append(b"hello, world");
        assert_eq!(12, buf.readable_bytes());
        assert_eq!(b"hello, world", buf.peek());
        assert_eq!("hello, world", buf.retrieve_all_as_string());
        assert_eq!(0, buf.readable_bytes());
        assert!(regions_sum_to_capacity(&buf));
    }

    #[test]
    fn partial_retrieve_advances_reader_only() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.retrieve(2);
        assert_eq!(b"cdef", buf.peek());
        assert_eq!(CHEAP_PREPEND + 2, buf.prependable_bytes());
        assert!(regions_sum_to_capacity(&buf));
    }

    #[test]
    fn retrieving_everything_resets_cursors() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(CHEAP_PREPEND, buf.prependable_bytes());
        assert_eq!(INITIAL_SIZE, buf.writable_bytes());
    }

    #[test]
    fn readable_bytes_tracks_appends_minus_retrieves() {
        let mut buf = Buffer::new();
        let mut expected = 0usize;
        for i in 0..50 {
            let chunk = vec![b'x'; 100 + i];
            buf.append(&chunk);
            expected += chunk.len();
            if i % 3 == 0 {
                buf.retrieve(50);
                expected -= 50;
            }
            assert_eq!(expected, buf.readable_bytes());
            assert!(regions_sum_to_capacity(&buf));
        }
    }

    #[test]
    fn growth_compacts_when_front_space_suffices() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(700);
        let capacity = buf.capacity();

        // 100 readable left, 224 writable, 708 prependable. Appending 600
        // fits after compaction without reallocating.
        buf.append(&vec![b'b'; 600]);
        assert_eq!(capacity, buf.capacity());
        assert_eq!(700, buf.readable_bytes());
        assert_eq!(CHEAP_PREPEND, buf.prependable_bytes());
        assert!(regions_sum_to_capacity(&buf));
    }

    #[test]
    fn growth_extends_capacity_when_compaction_cannot_fit() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 1000]);
        buf.append(&vec![b'b'; 1000]);
        assert_eq!(2000, buf.readable_bytes());
        assert!(buf.capacity() > CHEAP_PREPEND + INITIAL_SIZE);
        assert!(regions_sum_to_capacity(&buf));
    }

    #[test]
    fn prepend_uses_reserved_front_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(CHEAP_PREPEND - 4, buf.prependable_bytes());
        assert_eq!(b"\x00\x00\x00\x07payload", buf.peek());
    }

    #[test]
    fn find_crlf_scans_from_reader_or_offset() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: h\r\n");
        assert_eq!(Some(14), buf.find_crlf());
        assert_eq!(Some(23), buf.find_crlf_from(16));
        buf.retrieve(16);
        assert_eq!(Some(7), buf.find_crlf());
    }

    #[test]
    fn find_eol_locates_line_feed() {
        let mut buf = Buffer::new();
        buf.append(b"abc\ndef");
        assert_eq!(Some(3), buf.find_eol());
        assert_eq!(None, buf.find_eol_from(4));
    }

    #[test]
    fn unwrite_discards_tail_bytes() {
        let mut buf = Buffer::new();
        buf.append(b"12345");
        buf.unwrite(2);
        assert_eq!(b"123", buf.peek());
    }

    #[test]
    fn shrink_drops_excess_capacity() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'x'; 4000]);
        buf.retrieve(3900);
        buf.shrink(0);
        assert_eq!(100, buf.readable_bytes());
        assert_eq!(CHEAP_PREPEND + 100, buf.capacity());
    }

    #[test]
    fn read_from_fd_fills_writable_region_first() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        a.write_all(b"hello").expect("write");

        let mut buf = Buffer::new();
        let n = buf.read_from_fd(b.as_raw_fd()).expect("readv");
        assert_eq!(5, n);
        assert_eq!(b"hello", buf.peek());
    }

    #[test]
    fn read_from_fd_overflows_into_scratch_and_appends() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let payload = vec![b'z'; 70_000];
        a.write_all(&payload).expect("write");

        let mut buf = Buffer::new();
        let mut total = 0;
        while total < payload.len() {
            total += buf.read_from_fd(b.as_raw_fd()).expect("readv");
        }
        assert_eq!(payload.len(), total);
        assert_eq!(payload.len(), buf.readable_bytes());
        assert!(buf.peek().iter().all(|&b| b == b'z'));
        assert!(regions_sum_to_capacity(&buf));
    }
}
