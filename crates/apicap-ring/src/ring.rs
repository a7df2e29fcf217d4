//! Bounded byte ring buffer between the capturing thread and the disk writer.
//!
//! Design:
//! - One producer and one consumer. A mutex serializes cursor updates; nothing
//!   here waits for space or data, backpressure is the caller's job.
//! - Cursors are indices into an owned, fixed-length backing array and always
//!   stay in `[0, capacity)`.
//! - `read == write` means empty. "Full" only exists in the byte accounting, so
//!   a producer that writes exactly `size_to_write()` bytes leaves the ring
//!   looking empty again. Producers keep at least one byte of slack.
//! - [`RingBuffer::write`] handles wrap-around; [`RingBuffer::read`] does not.
//!   Wrap-aware consumers use [`RingBuffer::peek`] followed by
//!   [`RingBuffer::read_pointer_advance`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The caller did not check [`RingBuffer::size_to_write`] first.
    #[error("write of {requested} bytes exceeds free space ({free} bytes)")]
    Overflow { requested: usize, free: usize },
}

struct Cursors {
    storage: Box<[u8]>,
    write: usize,
    read: usize,
}

impl Cursors {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn size_to_write(&self) -> usize {
        let cap = self.capacity();
        match self.write.cmp(&self.read) {
            Ordering::Greater => cap - (self.write - self.read),
            Ordering::Equal => cap,
            Ordering::Less => self.read - self.write,
        }
    }
}

pub struct RingBuffer {
    capacity: usize,
    cursors: Mutex<Cursors>,
}

impl RingBuffer {
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            capacity,
            cursors: Mutex::new(Cursors {
                storage: vec![0u8; capacity].into_boxed_slice(),
                write: 0,
                read: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        // Cursor updates are single assignments after the copy, so a panic in
        // another thread cannot leave them half-updated.
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes the producer may write right now.
    pub fn size_to_write(&self) -> usize {
        self.lock().size_to_write()
    }

    /// Bytes written but not yet consumed. Always `capacity - size_to_write()`.
    pub fn size_to_read(&self) -> usize {
        self.capacity - self.size_to_write()
    }

    pub fn is_empty(&self) -> bool {
        self.size_to_read() == 0
    }

    /// Appends `data` at the write cursor, splitting the copy in two when it
    /// crosses the physical end of the buffer.
    ///
    /// Writing more than [`Self::size_to_write`] is a contract violation: debug
    /// builds panic, release builds return [`WriteError::Overflow`] without
    /// touching the buffer. The write is never partial.
    pub fn write(&self, data: &[u8]) -> Result<(), WriteError> {
        let mut cursors = self.lock();
        let free = cursors.size_to_write();
        if data.len() > free {
            drop(cursors);
            let err = WriteError::Overflow {
                requested: data.len(),
                free,
            };
            if cfg!(debug_assertions) {
                panic!("{err}");
            }
            return Err(err);
        }

        let cap = cursors.capacity();
        let start = cursors.write;
        let tail = cap - start;
        if data.len() > tail {
            let (end_part, begin_part) = data.split_at(tail);
            cursors.storage[start..].copy_from_slice(end_part);
            cursors.storage[..begin_part.len()].copy_from_slice(begin_part);
            cursors.write = begin_part.len();
        } else {
            cursors.storage[start..start + data.len()].copy_from_slice(data);
            cursors.write = (start + data.len()) % cap;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes starting at the read cursor and advances it.
    ///
    /// Unlike [`Self::write`] this does not wrap: the requested range must not
    /// cross the physical end of the buffer (check [`Self::read_overflows`]).
    /// Consumers that need wrap-around go through [`Self::peek`] and
    /// [`Self::read_pointer_advance`].
    ///
    /// # Panics
    /// Panics if the range crosses the end of the backing storage.
    pub fn read(&self, buf: &mut [u8]) {
        let mut cursors = self.lock();
        let cap = cursors.capacity();
        let start = cursors.read;
        let end = start + buf.len();
        assert!(
            end <= cap,
            "read of {} bytes at index {start} crosses the end of a {cap}-byte ring",
            buf.len()
        );
        buf.copy_from_slice(&cursors.storage[start..end]);
        cursors.read = end % cap;
    }

    /// Index of the next byte to be consumed.
    pub fn read_pointer(&self) -> usize {
        self.lock().read
    }

    /// Whether `size` bytes starting at the read cursor cross the physical end.
    pub fn read_overflows(&self, size: usize) -> bool {
        self.lock().read + size > self.capacity
    }

    /// How many of `size` bytes starting at the read cursor lie past the
    /// physical end (zero if none).
    pub fn read_overflows_by(&self, size: usize) -> usize {
        (self.lock().read + size).saturating_sub(self.capacity)
    }

    /// Calls `f` with the one or two slices covering `size` bytes from the read
    /// cursor, in logical order. The cursor does not move.
    ///
    /// The lock is held while `f` runs, so keep it to a copy.
    ///
    /// # Panics
    /// Panics if `size > capacity`.
    pub fn peek<R>(&self, size: usize, f: impl FnOnce(&[u8], &[u8]) -> R) -> R {
        assert!(size <= self.capacity, "peek larger than the ring");
        let cursors = self.lock();
        let start = cursors.read;
        let tail = self.capacity - start;
        if size > tail {
            f(&cursors.storage[start..], &cursors.storage[..size - tail])
        } else {
            f(&cursors.storage[start..start + size], &[])
        }
    }

    /// Advances the read cursor by `size`, wrapping past the physical end.
    ///
    /// # Panics
    /// Panics if `size > capacity`.
    pub fn read_pointer_advance(&self, size: usize) {
        assert!(size <= self.capacity, "advance larger than the ring");
        let mut cursors = self.lock();
        let next = cursors.read + size;
        cursors.read = if next > self.capacity {
            next - self.capacity
        } else {
            next % self.capacity
        };
    }

    /// Rewinds both cursors to the start of the buffer.
    ///
    /// Callers must make sure no producer is writing concurrently; bytes not
    /// yet consumed are dropped.
    pub fn reset(&self) {
        let mut cursors = self.lock();
        cursors.write = 0;
        cursors.read = 0;
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursors = self.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("write", &cursors.write)
            .field("read", &cursors.read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_is_fully_writable() {
        let rb = RingBuffer::new(16);
        assert_eq!(rb.size_to_write(), 16);
        assert_eq!(rb.size_to_read(), 0);
        assert!(rb.is_empty());
    }

    #[test]
    fn accounting_tracks_cursor_relation() {
        let rb = RingBuffer::new(16);
        rb.write(&[1; 10]).unwrap();
        // write ahead of read
        assert_eq!(rb.size_to_write(), 6);
        assert_eq!(rb.size_to_read(), 10);

        rb.read_pointer_advance(8);
        rb.write(&[2; 10]).unwrap();
        // write wrapped behind read: write=4, read=8
        assert_eq!(rb.size_to_write(), 4);
        assert_eq!(rb.size_to_read(), 12);
    }

    #[test]
    fn wrapping_write_splits_across_the_end() {
        let rb = RingBuffer::new(8);
        rb.write(&[0; 6]).unwrap();
        rb.read_pointer_advance(6);
        rb.write(&[1, 2, 3, 4, 5]).unwrap();

        assert!(rb.read_overflows(5));
        assert_eq!(rb.read_overflows_by(5), 3);
        let got = rb.peek(5, |a, b| [a, b].concat());
        assert_eq!(got, vec![1, 2, 3, 4, 5]);

        rb.read_pointer_advance(5);
        assert_eq!(rb.read_pointer(), 3);
        assert!(rb.is_empty());
    }

    #[test]
    fn read_lands_on_end_and_wraps_cursor() {
        let rb = RingBuffer::new(4);
        rb.write(&[9, 8, 7, 6]).unwrap();
        let mut buf = [0u8; 4];
        rb.read(&mut buf);
        assert_eq!(buf, [9, 8, 7, 6]);
        assert_eq!(rb.read_pointer(), 0);
    }

    #[test]
    #[should_panic(expected = "crosses the end")]
    fn read_does_not_wrap() {
        let rb = RingBuffer::new(8);
        rb.write(&[0; 6]).unwrap();
        rb.read_pointer_advance(6);
        rb.write(&[1; 4]).unwrap();
        let mut buf = [0u8; 4];
        rb.read(&mut buf);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "exceeds free space"))]
    fn oversized_write_is_rejected() {
        let rb = RingBuffer::new(8);
        rb.write(&[0; 5]).unwrap();
        let err = rb.write(&[0; 4]).unwrap_err();
        assert_eq!(
            err,
            WriteError::Overflow {
                requested: 4,
                free: 3
            }
        );
        assert_eq!(rb.size_to_read(), 5);
    }

    #[test]
    fn reset_rewinds_both_cursors() {
        let rb = RingBuffer::new(8);
        rb.write(&[1; 5]).unwrap();
        rb.read_pointer_advance(2);
        rb.reset();
        assert_eq!(rb.read_pointer(), 0);
        assert_eq!(rb.size_to_write(), 8);
    }
}
