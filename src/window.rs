/*!
The byte window that backs a `LineBuffer`: a contiguous, heap-backed
cache of one range of the (logical) source stream. The window knows
nothing about descriptors or compression; the owner supplies bytes
through `fetch` and the window only manages placement and growth.
*/

use std::cmp;
use std::io;

use crate::{Error, Result};

/// The initial allocation for a window.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// The hard ceiling on a window's allocation. A single line longer than
/// this cannot be read with `read_line`.
pub const MAX_BUFFER_SIZE: usize = 16 * DEFAULT_BUFFER_SIZE;

/// A cached slice of the source stream.
///
/// Invariants: `used <= capacity <= MAX_BUFFER_SIZE`, and for any offset
/// `o` in `[base_offset, base_offset + used)`, `buf[o - base_offset]` is
/// the byte at source offset `o`.
pub struct ByteWindow {
    buf: Vec<u8>,
    base_offset: u64,
    used: usize,
}

impl ByteWindow {
    pub fn new() -> ByteWindow {
        ByteWindow::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> ByteWindow {
        assert!(capacity > 0 && capacity <= MAX_BUFFER_SIZE);
        ByteWindow { buf: vec![0; capacity], base_offset: 0, used: 0 }
    }

    /// The source offset of the first cached byte.
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// One past the source offset of the last cached byte.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.used as u64
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// True if the byte at `offset` is cached.
    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        self.base_offset <= offset && offset < self.end_offset()
    }

    /// Make room so that `min_length` bytes starting at source offset
    /// `start` can be cached. Cached data at `start` survives; data
    /// before it may be discarded by sliding the live region to the
    /// front of the allocation. Grows by doubling, capped at
    /// `MAX_BUFFER_SIZE`.
    pub fn ensure(&mut self, start: u64, min_length: usize) -> Result<()> {
        if start < self.base_offset {
            return Err(Error::Seek { offset: start, window_start: self.base_offset });
        }
        let off = (start - self.base_offset) as usize;
        if off > self.used {
            // Nothing cached at or after `start`; restart the window there.
            self.base_offset = start;
            self.used = 0;
        } else if off > 0 && self.buf.len() - off < min_length {
            self.buf.copy_within(off..self.used, 0);
            self.base_offset = start;
            self.used -= off;
        }

        let off = (start - self.base_offset) as usize;
        let needed = off + min_length;
        if self.buf.len() >= needed {
            return Ok(());
        }
        if needed > MAX_BUFFER_SIZE {
            return Err(Error::BufferExhausted(needed));
        }
        let mut new_cap = self.buf.len();
        while new_cap < needed {
            new_cap = cmp::min(new_cap * 2, MAX_BUFFER_SIZE);
        }
        self.buf.resize(new_cap, 0);
        Ok(())
    }

    /// Append bytes to the cache by letting `read_into` fill the free
    /// tail of the allocation. Returns the number of bytes loaded; zero
    /// means the reader is at end of stream (or the window is full).
    pub fn fetch<F>(&mut self, read_into: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let used = self.used;
        let n = read_into(&mut self.buf[used..])?;
        assert!(used + n <= self.buf.len());
        self.used = used + n;
        Ok(n)
    }

    /// The cached bytes from `offset` to the end of the cache. The
    /// caller must have established `contains(offset)` or
    /// `offset == end_offset()`.
    #[inline]
    pub fn slice_from(&self, offset: u64) -> &[u8] {
        let off = (offset - self.base_offset) as usize;
        &self.buf[off..self.used]
    }

    /// Forget the cached bytes. The window's base moves past everything
    /// consumed so far so that stale data can never be re-served.
    pub fn invalidate(&mut self) {
        self.base_offset += self.used as u64;
        self.used = 0;
    }

    /// Clear all state, returning the window to offset zero.
    pub fn clear(&mut self) {
        self.base_offset = 0;
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteWindow, MAX_BUFFER_SIZE};
    use crate::Error;

    fn fill(w: &mut ByteWindow, bytes: &[u8]) {
        w.fetch(|buf| {
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(bytes.len())
        })
        .unwrap();
    }

    #[test]
    fn cached_bytes_are_addressed_by_source_offset() {
        let mut w = ByteWindow::with_capacity(16);
        fill(&mut w, b"abcdef");
        assert!(w.contains(0));
        assert!(w.contains(5));
        assert!(!w.contains(6));
        assert_eq!(w.slice_from(2), b"cdef");
    }

    #[test]
    fn ensure_slides_the_live_region() {
        let mut w = ByteWindow::with_capacity(8);
        fill(&mut w, b"abcdefgh");
        // Room for 6 more bytes at offset 4 requires discarding a..d.
        w.ensure(4, 6).unwrap();
        assert_eq!(w.base_offset(), 4);
        assert_eq!(w.used(), 4);
        assert_eq!(w.slice_from(4), b"efgh");
        assert!(w.capacity() >= 6);
    }

    #[test]
    fn ensure_grows_by_doubling() {
        let mut w = ByteWindow::with_capacity(8);
        fill(&mut w, b"abcd");
        w.ensure(0, 100).unwrap();
        assert_eq!(w.slice_from(0), b"abcd");
        assert!(w.capacity() >= 100);
    }

    #[test]
    fn ensure_fails_past_the_ceiling() {
        let mut w = ByteWindow::with_capacity(8);
        match w.ensure(0, MAX_BUFFER_SIZE + 1) {
            Err(Error::BufferExhausted(_)) => {}
            other => panic!("expected BufferExhausted, got {:?}", other),
        }
    }

    #[test]
    fn ensure_rejects_offsets_behind_the_window() {
        let mut w = ByteWindow::with_capacity(8);
        fill(&mut w, b"abcdefgh");
        w.ensure(4, 8).unwrap();
        match w.ensure(0, 1) {
            Err(Error::Seek { offset: 0, window_start: 4 }) => {}
            other => panic!("expected Seek, got {:?}", other),
        }
    }

    #[test]
    fn ensure_restarts_after_a_forward_gap() {
        let mut w = ByteWindow::with_capacity(8);
        fill(&mut w, b"abcd");
        w.ensure(100, 4).unwrap();
        assert_eq!(w.base_offset(), 100);
        assert_eq!(w.used(), 0);
    }

    #[test]
    fn invalidate_discards_cache_but_not_position() {
        let mut w = ByteWindow::with_capacity(8);
        fill(&mut w, b"abcd");
        w.invalidate();
        assert_eq!(w.base_offset(), 4);
        assert_eq!(w.used(), 0);
    }
}
