//! Stream discipline: raw bytes, no framing.

use super::{ReaderSlot, RingBuffer, WriterSlot};
use crate::error::ShmResult;
use std::sync::atomic::Ordering;

/// Writer handle of a stream ring.
pub struct StreamWriter<'a> {
    ring: &'a RingBuffer,
    _slot: WriterSlot<'a>,
}

impl<'a> StreamWriter<'a> {
    pub(crate) fn new(ring: &'a RingBuffer) -> ShmResult<Self> {
        let slot = ring.acquire_writer()?;
        Ok(Self { ring, _slot: slot })
    }

    /// Append as much of `bytes` as fits. Returns the number accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let h = self.ring.header();
        let cap = self.ring.capacity();
        let head = h.head.load(Ordering::Relaxed);
        let tail = h.tail.load(Ordering::Acquire);
        let free = cap - (head - tail) as usize;
        let n = bytes.len().min(free);
        if n < bytes.len() {
            h.full_count.fetch_add(1, Ordering::Relaxed);
        }
        if n == 0 {
            return 0;
        }
        let pos = (head % cap as u64) as usize;
        let first = n.min(cap - pos);
        let data = self.ring.data();
        // SAFETY: [head, head + n) is free space owned by the writer.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(pos), first);
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data, n - first);
        }
        h.head.store(head + n as u64, Ordering::Release);
        h.records_written.fetch_add(1, Ordering::Relaxed);
        n
    }

    /// Free space in bytes.
    pub fn space(&self) -> usize {
        let h = self.ring.header();
        self.ring.capacity()
            - (h.head.load(Ordering::Relaxed) - h.tail.load(Ordering::Acquire)) as usize
    }
}

/// Reader handle of a stream ring.
pub struct StreamReader<'a> {
    ring: &'a RingBuffer,
    _slot: ReaderSlot<'a>,
}

impl<'a> StreamReader<'a> {
    pub(crate) fn new(ring: &'a RingBuffer) -> ShmResult<Self> {
        let slot = ring.acquire_reader()?;
        Ok(Self { ring, _slot: slot })
    }

    /// Unread bytes.
    pub fn available(&self) -> usize {
        let h = self.ring.header();
        (h.head.load(Ordering::Acquire) - h.tail.load(Ordering::Relaxed)) as usize
    }

    /// Unread bytes as at most two slices, oldest first.
    pub fn peek(&self) -> (&[u8], &[u8]) {
        let cap = self.ring.capacity();
        let n = self.available();
        let pos = (self.ring.header().tail.load(Ordering::Relaxed) % cap as u64) as usize;
        let first = n.min(cap - pos);
        let data = self.ring.data();
        // SAFETY: the unread range was published by the writer and is not
        // reused until the tail moves past it.
        unsafe {
            (
                std::slice::from_raw_parts(data.add(pos), first),
                std::slice::from_raw_parts(data, n - first),
            )
        }
    }

    /// Drop `n` bytes (clamped to what is available).
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.available());
        let h = self.ring.header();
        let tail = h.tail.load(Ordering::Relaxed);
        h.tail.store(tail + n as u64, Ordering::Release);
        n
    }

    /// Copy up to `buf.len()` bytes out and consume them.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let (a, b) = self.peek();
        let first = a.len().min(buf.len());
        buf[..first].copy_from_slice(&a[..first]);
        let second = b.len().min(buf.len() - first);
        buf[first..first + second].copy_from_slice(&b[..second]);
        self.consume(first + second)
    }

    /// Discard everything unread. Returns the number of bytes dropped.
    pub fn flush(&mut self) -> usize {
        let n = self.available();
        self.consume(n)
    }
}
