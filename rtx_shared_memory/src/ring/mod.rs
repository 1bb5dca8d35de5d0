//! Ring buffers.
//!
//! A ring is a header, an optional scratch area and a fixed-capacity data
//! region. The discipline is chosen at creation:
//!
//! - [`RingMode::Record`]: self-delimited records; a reader sees a whole
//!   record or nothing.
//! - [`RingMode::Stream`]: a byte stream; writes accept as much as fits.
//! - [`RingMode::Multipart`]: records carrying one or more tagged frames.
//!
//! Head and tail are monotonically increasing byte counters; the index into
//! the data region is the counter modulo the capacity. The writer only
//! advances the head, the reader only advances the tail, so one writer and one
//! reader never block each other. A full ring rejects writes instead of
//! overwriting unread data.
//!
//! Whether a ring accepts more than one writer is a creation-time parameter
//! ([`WriterMode`]). Single-writer rings refuse a second writer handle;
//! multi-writer rings serialise writers with the ring mutex.
//!
//! A ring can live in a process-local anonymous mapping, in its own named
//! segment, or inside a region of another segment (an object store heap or the
//! session segment).

mod multipart;
mod record;
mod stream;

pub use multipart::{Frame, FrameFlags, FrameRef, MultipartReader, MultipartWriter, parse_frames};
pub use record::{RecordReader, RecordWriter};
pub use stream::{StreamReader, StreamWriter};

use crate::error::{ShmError, ShmResult};
use crate::key::SegmentKey;
use crate::mutex::ShmMutex;
use crate::platform::{get_current_pid, is_process_alive};
use crate::segment::{Segment, SegmentManager};
use bitflags::bitflags;
use memmap2::MmapMut;
use rtx_common::consts::{HAL_NAME_LEN, SHM_MIN_SIZE};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Magic of ring headers and ring segments.
pub const RING_MAGIC: u32 = 0x5249_4E47;

/// Layout version of ring headers.
pub const RING_LAYOUT_VERSION: u32 = 1;

/// Size of [`RingHeader`].
pub const RING_HEADER_SIZE: usize = 192;

/// Smallest accepted data capacity.
pub const RING_MIN_CAPACITY: usize = 64;

/// Largest accepted scratch area.
pub const RING_MAX_SCRATCH: usize = 64 * 1024;

/// Offset of the ring inside a dedicated ring segment (after the stored name).
const SEGMENT_RING_OFFSET: usize = 64;

/// Wire discipline of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingMode {
    /// Whole records.
    Record = 0,
    /// Byte stream.
    Stream = 1,
    /// Framed messages carried in records.
    Multipart = 2,
}

impl RingMode {
    /// Decode a stored mode.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(RingMode::Record),
            1 => Some(RingMode::Stream),
            2 => Some(RingMode::Multipart),
            _ => None,
        }
    }

    /// Lowercase name used in commands.
    pub fn as_str(self) -> &'static str {
        match self {
            RingMode::Record => "record",
            RingMode::Stream => "stream",
            RingMode::Multipart => "multipart",
        }
    }

    /// Parse a name produced by [`RingMode::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "record" => Some(RingMode::Record),
            "stream" => Some(RingMode::Stream),
            "multipart" | "multi" => Some(RingMode::Multipart),
            _ => None,
        }
    }
}

/// How many writers a ring admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    /// Exactly one writer handle at a time, lock free.
    Single,
    /// Any number of writers, serialised by the ring mutex.
    Multi,
}

bitflags! {
    /// Ring header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RingFlags: u32 {
        /// Writers take the ring mutex.
        const MULTI_WRITER = 1 << 0;
        /// A scratch area follows the header.
        const HAS_SCRATCH = 1 << 1;
    }
}

/// Creation parameters of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Wire discipline.
    pub mode: RingMode,
    /// Data capacity in bytes, a multiple of 8.
    pub capacity: usize,
    /// Scratch area size in bytes.
    pub scratch: usize,
    /// Writer admission.
    pub writers: WriterMode,
}

impl RingConfig {
    /// Single-writer record ring.
    pub fn record(capacity: usize) -> Self {
        Self {
            mode: RingMode::Record,
            capacity,
            scratch: 0,
            writers: WriterMode::Single,
        }
    }

    /// Single-writer stream ring.
    pub fn stream(capacity: usize) -> Self {
        Self {
            mode: RingMode::Stream,
            ..Self::record(capacity)
        }
    }

    /// Single-writer multipart ring.
    pub fn multipart(capacity: usize) -> Self {
        Self {
            mode: RingMode::Multipart,
            ..Self::record(capacity)
        }
    }

    /// Same ring admitting several writers.
    pub fn multi_writer(mut self) -> Self {
        self.writers = WriterMode::Multi;
        self
    }

    /// Same ring with a scratch area.
    pub fn with_scratch(mut self, bytes: usize) -> Self {
        self.scratch = bytes;
        self
    }

    /// Check the parameters.
    pub fn validate(&self) -> ShmResult<()> {
        if self.capacity < RING_MIN_CAPACITY
            || self.capacity % 8 != 0
            || self.capacity > (u32::MAX / 2) as usize
        {
            return Err(ShmError::InvalidRing {
                reason: format!(
                    "capacity {} must be a multiple of 8, at least {}",
                    self.capacity, RING_MIN_CAPACITY
                ),
            });
        }
        if self.scratch > RING_MAX_SCRATCH {
            return Err(ShmError::InvalidRing {
                reason: format!("scratch {} exceeds {}", self.scratch, RING_MAX_SCRATCH),
            });
        }
        if self.writers == WriterMode::Multi && self.mode == RingMode::Stream {
            return Err(ShmError::InvalidRing {
                reason: "stream rings admit a single writer".to_string(),
            });
        }
        Ok(())
    }

    /// Bytes needed for header, scratch and data.
    pub fn total_size(&self) -> usize {
        RING_HEADER_SIZE + self.scratch.next_multiple_of(8) + self.capacity
    }
}

/// Header at the start of every ring.
#[repr(C, align(64))]
pub struct RingHeader {
    magic: AtomicU32,
    mode: u32,
    flags: u32,
    capacity: u32,
    scratch_size: u32,
    readers: AtomicU32,
    writers: AtomicU32,
    pub(crate) mutex: ShmMutex,
    pub(crate) full_count: AtomicU64,
    pub(crate) lock_failures: AtomicU64,
    pub(crate) records_written: AtomicU64,
    _pad0: [u8; 8],
    pub(crate) head: AtomicU64,
    _pad1: [u8; 56],
    pub(crate) tail: AtomicU64,
    _pad2: [u8; 56],
}

static_assertions::const_assert_eq!(std::mem::size_of::<RingHeader>(), RING_HEADER_SIZE);

/// Counters of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    /// Writes rejected because the ring was full.
    pub full: u64,
    /// Writes rejected because the ring mutex was not acquired in time.
    pub lock_failures: u64,
    /// Records (or stream writes) accepted.
    pub written: u64,
    /// Bytes currently unread.
    pub used: usize,
    /// Data capacity.
    pub capacity: usize,
    /// Attached readers.
    pub readers: u32,
    /// Attached writers.
    pub writers: u32,
}

enum Backing {
    Local(#[allow(dead_code)] MmapMut),
    Segment(#[allow(dead_code)] Arc<Segment>),
}

/// Handle to a ring.
pub struct RingBuffer {
    _backing: Backing,
    base: NonNull<u8>,
    name: String,
}

// SAFETY: all shared state is in the mapping and accessed through atomics,
// the ring mutex, or role handles that enforce single reader/writer.
unsafe impl Send for RingBuffer {}
// SAFETY: see above.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Ring in a process-local anonymous mapping.
    pub fn create_local(name: &str, config: &RingConfig) -> ShmResult<Self> {
        config.validate()?;
        let mut mmap = MmapMut::map_anon(config.total_size())?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(ShmError::InvalidSize { size: 0 })?;
        // SAFETY: the fresh mapping is exactly total_size bytes.
        unsafe { init_header(base, config) };
        Ok(Self {
            _backing: Backing::Local(mmap),
            base,
            name: name.to_string(),
        })
    }

    /// Ring in its own named segment of `instance`.
    pub fn create_segment(
        mgr: &SegmentManager,
        name: &str,
        instance: u8,
        config: &RingConfig,
    ) -> ShmResult<Self> {
        config.validate()?;
        check_ring_name(name)?;
        let size = (SEGMENT_RING_OFFSET + config.total_size()).max(SHM_MIN_SIZE);
        let seg = mgr.create(
            SegmentKey::ring(name, instance),
            size,
            RING_MAGIC,
            RING_LAYOUT_VERSION,
        )?;
        // SAFETY: the data area is at least SEGMENT_RING_OFFSET long.
        unsafe {
            std::ptr::copy_nonoverlapping(name.as_ptr(), seg.data_ptr(), name.len());
        }
        let seg = Arc::new(seg);
        // SAFETY: the region after the stored name holds total_size bytes.
        unsafe { Self::init_in(seg, SEGMENT_RING_OFFSET as u32, name, config) }
    }

    /// Attach to the ring segment created by [`RingBuffer::create_segment`].
    pub fn attach_segment(mgr: &SegmentManager, name: &str, instance: u8) -> ShmResult<Self> {
        check_ring_name(name)?;
        let seg = mgr.attach(SegmentKey::ring(name, instance), RING_MAGIC, RING_LAYOUT_VERSION)?;
        // SAFETY: ring segments start with the NUL padded ring name.
        let stored = unsafe { std::slice::from_raw_parts(seg.data_ptr(), HAL_NAME_LEN) };
        let end = stored.iter().position(|&b| b == 0).unwrap_or(HAL_NAME_LEN);
        if &stored[..end] != name.as_bytes() {
            return Err(ShmError::InvalidRing {
                reason: format!(
                    "segment for '{}' holds ring '{}'",
                    name,
                    String::from_utf8_lossy(&stored[..end])
                ),
            });
        }
        // SAFETY: validated by magic below.
        unsafe { Self::attach_in(Arc::new(seg), SEGMENT_RING_OFFSET as u32, name) }
    }

    /// Initialise a ring at `offset` in the data area of `owner`.
    ///
    /// # Safety
    ///
    /// `offset` must be 64-byte aligned, `[offset, offset + total_size)` must
    /// lie in the data area and be reserved for this ring.
    pub unsafe fn init_in(
        owner: Arc<Segment>,
        offset: u32,
        name: &str,
        config: &RingConfig,
    ) -> ShmResult<Self> {
        config.validate()?;
        if offset as usize + config.total_size() > owner.data_size() {
            return Err(ShmError::InvalidSize {
                size: config.total_size(),
            });
        }
        // SAFETY: caller contract.
        let base = unsafe { NonNull::new_unchecked(owner.data_ptr().add(offset as usize)) };
        // SAFETY: caller contract.
        unsafe { init_header(base, config) };
        Ok(Self {
            _backing: Backing::Segment(owner),
            base,
            name: name.to_string(),
        })
    }

    /// Attach to a ring previously initialised at `offset` in `owner`.
    ///
    /// # Safety
    ///
    /// `offset` must designate a ring region inside the data area of `owner`.
    pub unsafe fn attach_in(owner: Arc<Segment>, offset: u32, name: &str) -> ShmResult<Self> {
        if offset as usize + RING_HEADER_SIZE > owner.data_size() {
            return Err(ShmError::InvalidSize {
                size: offset as usize,
            });
        }
        // SAFETY: caller contract.
        let base = unsafe { NonNull::new_unchecked(owner.data_ptr().add(offset as usize)) };
        let ring = Self {
            _backing: Backing::Segment(owner),
            base,
            name: name.to_string(),
        };
        let found = ring.header().magic.load(Ordering::Acquire);
        if found != RING_MAGIC || RingMode::from_u32(ring.header().mode).is_none() {
            return Err(ShmError::VersionMismatch {
                name: name.to_string(),
                expected_magic: RING_MAGIC,
                found_magic: found,
                expected_version: RING_LAYOUT_VERSION,
                found_version: RING_LAYOUT_VERSION,
            });
        }
        Ok(ring)
    }

    /// Ring name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn header(&self) -> &RingHeader {
        // SAFETY: base points to an initialised header.
        unsafe { &*(self.base.as_ptr() as *const RingHeader) }
    }

    /// Wire discipline.
    pub fn mode(&self) -> RingMode {
        RingMode::from_u32(self.header().mode).unwrap_or(RingMode::Record)
    }

    /// Writer admission.
    pub fn writer_mode(&self) -> WriterMode {
        if RingFlags::from_bits_truncate(self.header().flags).contains(RingFlags::MULTI_WRITER) {
            WriterMode::Multi
        } else {
            WriterMode::Single
        }
    }

    /// Data capacity.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Largest record payload this ring accepts.
    pub fn max_record(&self) -> usize {
        self.capacity() / 2 - record::RECORD_HEADER
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> RingStats {
        let h = self.header();
        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Acquire);
        let writers = h.writers.load(Ordering::Acquire);
        RingStats {
            full: h.full_count.load(Ordering::Relaxed),
            lock_failures: h.lock_failures.load(Ordering::Relaxed),
            written: h.records_written.load(Ordering::Relaxed),
            used: head.saturating_sub(tail) as usize,
            capacity: h.capacity as usize,
            readers: u32::from(h.readers.load(Ordering::Acquire) != 0),
            writers: match self.writer_mode() {
                WriterMode::Single => u32::from(writers != 0),
                WriterMode::Multi => writers,
            },
        }
    }

    /// Scratch area for reader/writer private bookkeeping.
    pub fn scratch(&mut self) -> &mut [u8] {
        let len = self.header().scratch_size as usize;
        // SAFETY: the scratch area follows the header and is len bytes long;
        // &mut self makes this the only slice from this handle.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(RING_HEADER_SIZE), len) }
    }

    pub(crate) fn data(&self) -> *mut u8 {
        let scratch = (self.header().scratch_size as usize).next_multiple_of(8);
        // SAFETY: data follows header and scratch.
        unsafe { self.base.as_ptr().add(RING_HEADER_SIZE + scratch) }
    }

    pub(crate) fn expect_mode(&self, modes: &[RingMode]) -> ShmResult<()> {
        if modes.contains(&self.mode()) {
            Ok(())
        } else {
            Err(ShmError::InvalidRing {
                reason: format!("ring '{}' is a {} ring", self.name, self.mode().as_str()),
            })
        }
    }

    pub(crate) fn acquire_writer(&self) -> ShmResult<WriterSlot<'_>> {
        let h = self.header();
        match self.writer_mode() {
            WriterMode::Multi => {
                h.writers.fetch_add(1, Ordering::AcqRel);
            }
            WriterMode::Single => claim_slot(&h.writers, ShmError::WriterBusy)?,
        }
        Ok(WriterSlot { ring: self })
    }

    pub(crate) fn acquire_reader(&self) -> ShmResult<ReaderSlot<'_>> {
        claim_slot(&self.header().readers, ShmError::ReaderBusy)?;
        Ok(ReaderSlot { ring: self })
    }

    /// Record writer handle.
    pub fn record_writer(&self) -> ShmResult<RecordWriter<'_>> {
        self.expect_mode(&[RingMode::Record])?;
        RecordWriter::new(self)
    }

    /// Record reader handle.
    pub fn record_reader(&self) -> ShmResult<RecordReader<'_>> {
        self.expect_mode(&[RingMode::Record])?;
        RecordReader::new(self)
    }

    /// Stream writer handle.
    pub fn stream_writer(&self) -> ShmResult<StreamWriter<'_>> {
        self.expect_mode(&[RingMode::Stream])?;
        StreamWriter::new(self)
    }

    /// Stream reader handle.
    pub fn stream_reader(&self) -> ShmResult<StreamReader<'_>> {
        self.expect_mode(&[RingMode::Stream])?;
        StreamReader::new(self)
    }

    /// Multipart writer handle.
    pub fn multipart_writer(&self) -> ShmResult<MultipartWriter<'_>> {
        self.expect_mode(&[RingMode::Multipart])?;
        Ok(MultipartWriter::new(RecordWriter::new(self)?))
    }

    /// Multipart reader handle.
    pub fn multipart_reader(&self) -> ShmResult<MultipartReader<'_>> {
        self.expect_mode(&[RingMode::Multipart])?;
        Ok(MultipartReader::new(RecordReader::new(self)?))
    }
}

fn check_ring_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.len() >= HAL_NAME_LEN {
        return Err(ShmError::InvalidRing {
            reason: format!("ring name '{name}' must be 1..{HAL_NAME_LEN} bytes"),
        });
    }
    Ok(())
}

// Claim a single-occupant slot holding the occupant pid; a dead occupant is replaced.
fn claim_slot(slot: &AtomicU32, busy: ShmError) -> ShmResult<()> {
    let me = get_current_pid();
    match slot.compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(()),
        Err(pid) if !is_process_alive(pid) => slot
            .compare_exchange(pid, me, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| busy),
        Err(_) => Err(busy),
    }
}

/// # Safety
///
/// `base` must be valid for `config.total_size()` bytes of writes.
unsafe fn init_header(base: NonNull<u8>, config: &RingConfig) {
    let mut flags = RingFlags::empty();
    flags.set(RingFlags::MULTI_WRITER, config.writers == WriterMode::Multi);
    flags.set(RingFlags::HAS_SCRATCH, config.scratch > 0);
    let hdr = RingHeader {
        magic: AtomicU32::new(0),
        mode: config.mode as u32,
        flags: flags.bits(),
        capacity: config.capacity as u32,
        scratch_size: config.scratch as u32,
        readers: AtomicU32::new(0),
        writers: AtomicU32::new(0),
        mutex: ShmMutex::new(),
        full_count: AtomicU64::new(0),
        lock_failures: AtomicU64::new(0),
        records_written: AtomicU64::new(0),
        _pad0: [0; 8],
        head: AtomicU64::new(0),
        _pad1: [0; 56],
        tail: AtomicU64::new(0),
        _pad2: [0; 56],
    };
    let ptr = base.as_ptr();
    // SAFETY: caller contract.
    unsafe {
        std::ptr::write_bytes(ptr, 0, config.total_size());
        (ptr as *mut RingHeader).write(hdr);
        (*(ptr as *const RingHeader))
            .magic
            .store(RING_MAGIC, Ordering::Release);
    }
}

/// Writer occupancy, released on drop.
pub(crate) struct WriterSlot<'a> {
    ring: &'a RingBuffer,
}

impl Drop for WriterSlot<'_> {
    fn drop(&mut self) {
        let h = self.ring.header();
        match self.ring.writer_mode() {
            WriterMode::Multi => {
                h.writers.fetch_sub(1, Ordering::AcqRel);
            }
            WriterMode::Single => h.writers.store(0, Ordering::Release),
        }
    }
}

/// Reader occupancy, released on drop.
pub(crate) struct ReaderSlot<'a> {
    ring: &'a RingBuffer,
}

impl Drop for ReaderSlot<'_> {
    fn drop(&mut self) {
        self.ring.header().readers.store(0, Ordering::Release);
    }
}
