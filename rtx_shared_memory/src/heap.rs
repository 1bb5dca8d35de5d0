//! Offset-addressed first-fit arena heap.
//!
//! The heap manages a byte range of a segment. Every position is an offset
//! from the segment data base, never an address, so the same heap is valid in
//! every process regardless of where the segment is mapped. Offset `0` is the
//! null offset.
//!
//! Blocks carry an 8-byte header `{size, tag}`; the payload follows. Free
//! blocks keep the offset of the next free block in their first payload word.
//! The free list is sorted by offset and neighbours are merged on free.
//!
//! A [`Heap`] is a view and does no locking; callers hold the segment mutex.

use crate::error::{ShmError, ShmResult};
use bitflags::bitflags;
use std::marker::PhantomData;
use tracing::trace;

/// Offset from a segment data base. `0` means none.
pub type ShmOff = u32;

const BLOCK_HEADER: u32 = 8;
const ALIGN: u32 = 8;
const MIN_BLOCK: u32 = 16;
const USED_TAG: u32 = 0x5553_4544;
const FREE_TAG: u32 = 0x4652_4545;

bitflags! {
    /// Heap behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// Emit a trace event for every allocation and free.
        const TRACE = 1 << 0;
    }
}

/// Heap bookkeeping stored inside the segment it manages.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HeapHeader {
    arena_start: u32,
    arena_end: u32,
    free_head: u32,
    free_bytes: u32,
    live: u32,
    total_allocs: u32,
    total_frees: u32,
    flags: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<HeapHeader>(), 32);

/// Snapshot of heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap.
    pub total: usize,
    /// Bytes in free blocks, headers included.
    pub free: usize,
    /// Live allocations.
    pub live: u32,
    /// Allocations since creation.
    pub total_allocs: u32,
    /// Frees since creation.
    pub total_frees: u32,
    /// Number of free blocks.
    pub fragments: u32,
    /// Largest free block, header included.
    pub largest_free: usize,
}

/// View over a heap living in a mapped segment.
pub struct Heap<'a> {
    base: *mut u8,
    hdr: *mut HeapHeader,
    _lt: PhantomData<&'a mut HeapHeader>,
}

const fn align_up(v: u32) -> u32 {
    (v + ALIGN - 1) & !(ALIGN - 1)
}

impl<'a> Heap<'a> {
    /// Initialise a heap over `[start, end)` of the region at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping at least `end` bytes long, `hdr` must be
    /// valid for writes and outside `[start, end)`, `base` must be 8-byte
    /// aligned, and no other view of this heap may exist for `'a`.
    pub unsafe fn init(base: *mut u8, hdr: *mut HeapHeader, start: u32, end: u32) -> Heap<'a> {
        let start = align_up(start.max(ALIGN));
        let end = end & !(ALIGN - 1);
        // SAFETY: caller guarantees hdr is valid for writes.
        unsafe { hdr.write(HeapHeader::default()) };
        let heap = Heap {
            base,
            hdr,
            _lt: PhantomData,
        };
        let h = heap.header_mut();
        h.arena_start = start;
        h.arena_end = end.max(start);
        if end > start && end - start >= MIN_BLOCK {
            heap.set_size(start, end - start);
            heap.set_tag(start, FREE_TAG);
            heap.set_next(start, 0);
            h.free_head = start;
            h.free_bytes = end - start;
        }
        heap
    }

    /// View an initialised heap.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::init`], and the header must have been initialised.
    pub unsafe fn from_raw(base: *mut u8, hdr: *mut HeapHeader) -> Heap<'a> {
        Heap {
            base,
            hdr,
            _lt: PhantomData,
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut HeapHeader {
        // SAFETY: constructor contract; the view is the only accessor for 'a.
        unsafe { &mut *self.hdr }
    }

    fn word(&self, off: u32) -> *mut u32 {
        // SAFETY: offsets handled here are within the arena (checked by callers).
        unsafe { self.base.add(off as usize).cast::<u32>() }
    }

    fn size_at(&self, block: u32) -> u32 {
        // SAFETY: block is an aligned in-arena block offset.
        unsafe { self.word(block).read() }
    }

    fn set_size(&self, block: u32, size: u32) {
        // SAFETY: as above.
        unsafe { self.word(block).write(size) }
    }

    fn tag_at(&self, block: u32) -> u32 {
        // SAFETY: as above.
        unsafe { self.word(block + 4).read() }
    }

    fn set_tag(&self, block: u32, tag: u32) {
        // SAFETY: as above.
        unsafe { self.word(block + 4).write(tag) }
    }

    fn next_free(&self, block: u32) -> u32 {
        // SAFETY: free blocks are at least MIN_BLOCK long.
        unsafe { self.word(block + BLOCK_HEADER).read() }
    }

    fn set_next(&self, block: u32, next: u32) {
        // SAFETY: as above.
        unsafe { self.word(block + BLOCK_HEADER).write(next) }
    }

    fn link(&self, prev: u32, next: u32) {
        if prev == 0 {
            self.header_mut().free_head = next;
        } else {
            self.set_next(prev, next);
        }
    }

    /// Enable or disable allocation tracing.
    pub fn set_trace(&mut self, on: bool) {
        let h = self.header_mut();
        let mut flags = HeapFlags::from_bits_truncate(h.flags);
        flags.set(HeapFlags::TRACE, on);
        h.flags = flags.bits();
    }

    fn tracing(&self) -> bool {
        HeapFlags::from_bits_truncate(self.header_mut().flags).contains(HeapFlags::TRACE)
    }

    /// Allocate `size` zeroed bytes, 8-byte aligned. Returns the payload offset.
    pub fn alloc(&mut self, size: usize) -> ShmResult<ShmOff> {
        let available = self.header_mut().free_bytes as usize;
        let exhausted = ShmError::AllocationExhausted {
            requested: size,
            available,
        };
        if size > (u32::MAX - MIN_BLOCK - ALIGN) as usize {
            return Err(exhausted);
        }
        let need = align_up(size.max(ALIGN as usize) as u32 + BLOCK_HEADER).max(MIN_BLOCK);

        let mut prev = 0;
        let mut cur = self.header_mut().free_head;
        while cur != 0 {
            let bsize = self.size_at(cur);
            let next = self.next_free(cur);
            if bsize >= need {
                let taken = if bsize - need >= MIN_BLOCK {
                    let rest = cur + need;
                    self.set_size(rest, bsize - need);
                    self.set_tag(rest, FREE_TAG);
                    self.set_next(rest, next);
                    self.link(prev, rest);
                    self.set_size(cur, need);
                    need
                } else {
                    self.link(prev, next);
                    bsize
                };
                self.set_tag(cur, USED_TAG);
                let payload = cur + BLOCK_HEADER;
                // SAFETY: the payload lies inside the block just taken.
                unsafe {
                    std::ptr::write_bytes(
                        self.base.add(payload as usize),
                        0,
                        (taken - BLOCK_HEADER) as usize,
                    )
                };
                let h = self.header_mut();
                h.free_bytes -= taken;
                h.live += 1;
                h.total_allocs = h.total_allocs.wrapping_add(1);
                if self.tracing() {
                    trace!(offset = payload, size, block = taken, "heap alloc");
                }
                return Ok(payload);
            }
            prev = cur;
            cur = next;
        }
        Err(exhausted)
    }

    fn check_payload(&self, off: ShmOff) -> ShmResult<u32> {
        let h = self.header_mut();
        if off % ALIGN != 0 || off < h.arena_start + BLOCK_HEADER || off >= h.arena_end {
            return Err(ShmError::InvalidBlock { offset: off });
        }
        let block = off - BLOCK_HEADER;
        if self.tag_at(block) != USED_TAG {
            return Err(ShmError::InvalidBlock { offset: off });
        }
        Ok(block)
    }

    /// Return a block to the heap. Double frees are detected.
    pub fn free(&mut self, off: ShmOff) -> ShmResult<()> {
        let block = self.check_payload(off)?;
        let freed = self.size_at(block);
        let mut size = freed;
        self.set_tag(block, FREE_TAG);

        let mut prev = 0;
        let mut cur = self.header_mut().free_head;
        while cur != 0 && cur < block {
            prev = cur;
            cur = self.next_free(cur);
        }
        self.set_next(block, cur);
        self.link(prev, block);

        if cur != 0 && block + size == cur {
            size += self.size_at(cur);
            self.set_size(block, size);
            self.set_next(block, self.next_free(cur));
            self.set_tag(cur, 0);
        }
        if prev != 0 && prev + self.size_at(prev) == block {
            self.set_size(prev, self.size_at(prev) + size);
            self.set_next(prev, self.next_free(block));
            self.set_tag(block, 0);
        }

        let h = self.header_mut();
        h.free_bytes += freed;
        h.live -= 1;
        h.total_frees = h.total_frees.wrapping_add(1);
        if self.tracing() {
            trace!(offset = off, "heap free");
        }
        Ok(())
    }

    fn free_walk(&self) -> (u32, u32, u32) {
        let (mut total, mut count, mut largest) = (0u32, 0u32, 0u32);
        let mut cur = self.header_mut().free_head;
        while cur != 0 {
            let s = self.size_at(cur);
            total += s;
            count += 1;
            largest = largest.max(s);
            cur = self.next_free(cur);
        }
        (total, count, largest)
    }

    /// Usable bytes of the block at `off`.
    pub fn usable_size(&self, off: ShmOff) -> ShmResult<usize> {
        let block = self.check_payload(off)?;
        Ok((self.size_at(block) - BLOCK_HEADER) as usize)
    }

    /// Pointer to the byte at `off`.
    pub fn ptr(&self, off: ShmOff) -> *mut u8 {
        // SAFETY: pointer arithmetic only; dereferencing is up to the caller.
        unsafe { self.base.add(off as usize) }
    }

    /// Usage statistics.
    pub fn stats(&self) -> HeapStats {
        let (free, fragments, largest) = self.free_walk();
        let h = self.header_mut();
        HeapStats {
            total: (h.arena_end - h.arena_start) as usize,
            free: free as usize,
            live: h.live,
            total_allocs: h.total_allocs,
            total_frees: h.total_frees,
            fragments,
            largest_free: largest as usize,
        }
    }

    /// Verify free-list ordering, bounds and tags.
    pub fn check(&self) -> bool {
        let h = self.header_mut();
        let mut last_end = 0u32;
        let mut cur = h.free_head;
        let mut total = 0u32;
        while cur != 0 {
            if cur < h.arena_start || cur >= h.arena_end || cur < last_end {
                return false;
            }
            let s = self.size_at(cur);
            if self.tag_at(cur) != FREE_TAG || s < MIN_BLOCK || cur + s > h.arena_end {
                return false;
            }
            // Adjacent free blocks should have been merged.
            if cur == last_end {
                return false;
            }
            total += s;
            last_end = cur + s;
            cur = self.next_free(cur);
        }
        total == h.free_bytes
    }
}
