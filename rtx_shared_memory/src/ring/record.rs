//! Record discipline.
//!
//! Every record is an 8 byte header (payload length, padding) followed by the
//! payload padded to 8 bytes. A record never straddles the end of the data
//! region: when it does not fit contiguously the writer emits a wrap marker
//! that fills the rest of the region and places the record at the start.
//! The head only moves after the whole record is in place, so a reader sees a
//! complete record or nothing.

use super::{ReaderSlot, RingBuffer, WriterMode, WriterSlot};
use crate::error::{ShmError, ShmResult};
use crate::mutex::SpinBudget;
use std::sync::atomic::Ordering;

/// Bytes in front of each record payload.
pub(crate) const RECORD_HEADER: usize = 8;

const WRAP_MARKER: u32 = u32::MAX;

#[inline]
fn padded(len: usize) -> usize {
    len.next_multiple_of(8)
}

/// Writer handle of a record (or multipart) ring.
pub struct RecordWriter<'a> {
    ring: &'a RingBuffer,
    _slot: WriterSlot<'a>,
}

impl<'a> RecordWriter<'a> {
    pub(crate) fn new(ring: &'a RingBuffer) -> ShmResult<Self> {
        let slot = ring.acquire_writer()?;
        Ok(Self { ring, _slot: slot })
    }

    /// Append one record.
    pub fn write(&mut self, payload: &[u8]) -> ShmResult<()> {
        self.write_parts(&[payload])
    }

    /// Append one record made of the concatenation of `parts`.
    pub fn write_parts(&mut self, parts: &[&[u8]]) -> ShmResult<()> {
        let ring = self.ring;
        let h = ring.header();
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let max = ring.max_record();
        if len > max {
            return Err(ShmError::RecordTooLarge { size: len, max });
        }

        let _guard = match ring.writer_mode() {
            WriterMode::Single => None,
            WriterMode::Multi => match h.mutex.lock(SpinBudget::RT, "ring") {
                Ok(g) => Some(g),
                Err(e) => {
                    h.lock_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            },
        };

        let cap = ring.capacity() as u64;
        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Acquire);
        let free = cap - (head - tail);
        let pos = (head % cap) as usize;
        let need = (RECORD_HEADER + padded(len)) as u64;
        let to_end = cap - pos as u64;

        let (start, required) = if need <= to_end {
            (pos, need)
        } else {
            (0, to_end + need)
        };
        if required > free {
            h.full_count.fetch_add(1, Ordering::Relaxed);
            return Err(ShmError::WouldBlock);
        }

        let data = ring.data();
        // SAFETY: [head, head + required) is free space owned by this writer
        // until the head is published below.
        unsafe {
            if start != pos {
                (data.add(pos) as *mut u32).write(WRAP_MARKER);
            }
            let rec = data.add(start);
            (rec as *mut u32).write(len as u32);
            (rec.add(4) as *mut u32).write(0);
            let mut off = RECORD_HEADER;
            for part in parts {
                std::ptr::copy_nonoverlapping(part.as_ptr(), rec.add(off), part.len());
                off += part.len();
            }
        }
        h.head.store(head + required, Ordering::Release);
        h.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a record of `len` bytes would currently fit.
    pub fn fits(&self, len: usize) -> bool {
        let h = self.ring.header();
        let cap = self.ring.capacity() as u64;
        let head = h.head.load(Ordering::Acquire);
        let free = cap - (head - h.tail.load(Ordering::Acquire));
        let pos = head % cap;
        let need = (RECORD_HEADER + padded(len)) as u64;
        let required = if need <= cap - pos { need } else { cap - pos + need };
        len <= self.ring.max_record() && required <= free
    }
}

/// Reader handle of a record (or multipart) ring.
pub struct RecordReader<'a> {
    ring: &'a RingBuffer,
    _slot: ReaderSlot<'a>,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(ring: &'a RingBuffer) -> ShmResult<Self> {
        let slot = ring.acquire_reader()?;
        Ok(Self { ring, _slot: slot })
    }

    // Position of the next record and its length, skipping a wrap marker.
    fn locate(&mut self) -> Option<(usize, usize)> {
        let h = self.ring.header();
        let cap = self.ring.capacity() as u64;
        let data = self.ring.data();
        loop {
            let tail = h.tail.load(Ordering::Relaxed);
            let head = h.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            let pos = (tail % cap) as usize;
            // SAFETY: pos is 8-aligned and inside the data region; the
            // writer published this byte range before advancing head.
            let len = unsafe { (data.add(pos) as *const u32).read() };
            if len == WRAP_MARKER {
                h.tail.store(tail + (cap - pos as u64), Ordering::Release);
                continue;
            }
            return Some((pos, len as usize));
        }
    }

    /// Next record without consuming it.
    pub fn peek(&mut self) -> Option<&[u8]> {
        let (pos, len) = self.locate()?;
        // SAFETY: the record is complete and stays put until shift().
        Some(unsafe {
            std::slice::from_raw_parts(self.ring.data().add(pos + RECORD_HEADER), len)
        })
    }

    /// Length of the next record.
    pub fn next_len(&mut self) -> Option<usize> {
        self.locate().map(|(_, len)| len)
    }

    /// Discard the next record.
    pub fn shift(&mut self) -> ShmResult<()> {
        let (_, len) = self.locate().ok_or(ShmError::Empty)?;
        let h = self.ring.header();
        let tail = h.tail.load(Ordering::Relaxed);
        h.tail
            .store(tail + (RECORD_HEADER + padded(len)) as u64, Ordering::Release);
        Ok(())
    }

    /// Copy the next record into `out` (replacing its contents) and consume it.
    pub fn read(&mut self, out: &mut Vec<u8>) -> ShmResult<usize> {
        let rec = self.peek().ok_or(ShmError::Empty)?;
        out.clear();
        out.extend_from_slice(rec);
        self.shift()?;
        Ok(out.len())
    }

    /// No record is available.
    pub fn is_empty(&mut self) -> bool {
        self.locate().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::super::RingConfig;
    use super::*;

    #[test]
    fn write_then_read_in_order() {
        let ring = RingBuffer::create_local("r", &RingConfig::record(256)).unwrap();
        let mut w = ring.record_writer().unwrap();
        let mut r = ring.record_reader().unwrap();
        assert!(r.is_empty());
        w.write(b"one").unwrap();
        w.write(b"two!").unwrap();
        let mut buf = Vec::new();
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, b"one");
        assert_eq!(r.next_len(), Some(4));
        r.read(&mut buf).unwrap();
        assert_eq!(buf, b"two!");
        assert!(matches!(r.read(&mut buf), Err(ShmError::Empty)));
        assert!(matches!(r.shift(), Err(ShmError::Empty)));
    }

    #[test]
    fn full_ring_rejects_and_keeps_data() {
        let ring = RingBuffer::create_local("r", &RingConfig::record(64)).unwrap();
        let mut w = ring.record_writer().unwrap();
        let mut r = ring.record_reader().unwrap();
        w.write(&[1u8; 24]).unwrap();
        w.write(&[2u8; 24]).unwrap();
        assert!(matches!(w.write(&[3u8; 8]), Err(ShmError::WouldBlock)));
        assert_eq!(ring.stats().full, 1);
        assert_eq!(r.peek(), Some(&[1u8; 24][..]));
        r.shift().unwrap();
        assert_eq!(r.peek(), Some(&[2u8; 24][..]));
    }

    #[test]
    fn wraps_without_splitting_records() {
        let ring = RingBuffer::create_local("r", &RingConfig::record(128)).unwrap();
        let mut w = ring.record_writer().unwrap();
        let mut r = ring.record_reader().unwrap();
        let mut buf = Vec::new();
        for i in 0..50u8 {
            let payload = vec![i; (i as usize % 40) + 1];
            w.write(&payload).unwrap();
            r.read(&mut buf).unwrap();
            assert_eq!(buf, payload);
        }
        assert!(r.is_empty());
    }

    #[test]
    fn too_large_is_rejected() {
        let ring = RingBuffer::create_local("r", &RingConfig::record(128)).unwrap();
        let mut w = ring.record_writer().unwrap();
        assert_eq!(ring.max_record(), 56);
        assert!(w.fits(56));
        assert!(matches!(
            w.write(&[0u8; 57]),
            Err(ShmError::RecordTooLarge { size: 57, max: 56 })
        ));
        w.write(&[0u8; 56]).unwrap();
    }

    #[test]
    fn multi_writer_threads_interleave_whole_records() {
        let ring = RingBuffer::create_local("r", &RingConfig::record(4096).multi_writer()).unwrap();
        std::thread::scope(|s| {
            for t in 0..4u8 {
                let ring = &ring;
                s.spawn(move || {
                    let mut w = ring.record_writer().unwrap();
                    for _ in 0..10 {
                        w.write(&[t; 16]).unwrap();
                    }
                });
            }
        });
        let mut r = ring.record_reader().unwrap();
        let mut buf = Vec::new();
        let mut n = 0;
        while r.read(&mut buf).is_ok() {
            assert!(buf.iter().all(|&b| b == buf[0]));
            n += 1;
        }
        assert_eq!(n, 40);
        assert_eq!(ring.stats().written, 40);
    }
}
