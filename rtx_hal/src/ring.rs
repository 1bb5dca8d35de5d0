//! Rings allocated inside the object store arena.
//!
//! Every process attached to the store reaches these rings by name; no
//! separate segment is created.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectHeader, ObjectRef, ObjectType};
use crate::store::{HalGuard, HalStore};
use rtx_shared_memory::{RingBuffer, RingConfig, RingMode, WriterMode};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

const RING_ALIGN: u32 = 64;

/// Ring record in the arena. The ring itself lives at `ring_off`.
#[repr(C)]
#[derive(Debug)]
pub struct RingObject {
    pub(crate) hdr: ObjectHeader,
    mode: u32,
    multi_writer: u32,
    capacity: u32,
    scratch: u32,
    ring_off: u32,
    alloc_off: u32,
}

// SAFETY: repr(C), header first, no mutable fields.
unsafe impl HalObject for RingObject {
    const TYPE: ObjectType = ObjectType::Ring;
}

impl RingObject {
    /// Creation parameters.
    pub fn config(&self) -> RingConfig {
        RingConfig {
            mode: RingMode::from_u32(self.mode).unwrap_or(RingMode::Record),
            capacity: self.capacity as usize,
            scratch: self.scratch as usize,
            writers: if self.multi_writer != 0 {
                WriterMode::Multi
            } else {
                WriterMode::Single
            },
        }
    }
}

/// Snapshot of a store ring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingInfo {
    /// Ring name.
    pub name: String,
    /// Wire discipline.
    pub mode: &'static str,
    /// Data capacity.
    pub capacity: usize,
    /// Scratch size.
    pub scratch: usize,
    /// Multiple writers allowed.
    pub multi_writer: bool,
    /// Attached readers.
    pub readers: u32,
    /// Attached writers.
    pub writers: u32,
}

impl HalGuard<'_> {
    /// Create a ring in the arena.
    pub fn ring_new(&mut self, name: &str, config: &RingConfig) -> HalResult<ObjectRef> {
        config.validate()?;
        if self.find(ObjectType::Ring, name).is_some() {
            return Err(HalError::AlreadyExists {
                kind: "ring",
                name: name.to_string(),
            });
        }
        let alloc_off = self.alloc_raw(config.total_size() + RING_ALIGN as usize)?;
        let ring_off = alloc_off.next_multiple_of(RING_ALIGN);
        // SAFETY: [ring_off, ring_off + total_size) lies inside the fresh
        // allocation and ring_off is 64-aligned in the 64-aligned data area.
        let init = unsafe {
            RingBuffer::init_in(Arc::clone(self.store().segment()), ring_off, name, config)
        };
        if let Err(e) = init {
            self.free_bytes(alloc_off)?;
            return Err(e.into());
        }
        let res = self.insert(name, 0, |hdr| RingObject {
            hdr,
            mode: config.mode as u32,
            multi_writer: (config.writers == WriterMode::Multi) as u32,
            capacity: config.capacity as u32,
            scratch: config.scratch as u32,
            ring_off,
            alloc_off,
        });
        if res.is_err() {
            self.free_bytes(alloc_off)?;
        }
        debug!("Ring '{}' created ({} bytes)", name, config.capacity);
        res
    }

    fn ring_view(&self, r: ObjectRef) -> HalResult<RingBuffer> {
        let ro = self.get::<RingObject>(r);
        // SAFETY: ring_off was initialised by ring_new and stays reserved
        // until ring_delete.
        Ok(unsafe {
            RingBuffer::attach_in(
                Arc::clone(self.store().segment()),
                ro.ring_off,
                self.header(r).name(),
            )?
        })
    }

    /// Delete a ring nobody is attached to.
    pub fn ring_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Ring, name)?;
        let stats = self.ring_view(r)?.stats();
        if stats.readers > 0 || stats.writers > 0 {
            return Err(HalError::InUse {
                name: name.to_string(),
                reason: format!("{} reader(s), {} writer(s)", stats.readers, stats.writers),
            });
        }
        let alloc_off = self.get::<RingObject>(r).alloc_off;
        self.remove(r)?;
        self.free_bytes(alloc_off)?;
        debug!("Ring '{}' deleted", name);
        Ok(())
    }

    /// Snapshot of a ring.
    pub fn ring_info(&self, name: &str) -> HalResult<RingInfo> {
        let r = self.lookup(ObjectType::Ring, name)?;
        let cfg = self.get::<RingObject>(r).config();
        let stats = self.ring_view(r)?.stats();
        Ok(RingInfo {
            name: name.to_string(),
            mode: cfg.mode.as_str(),
            capacity: cfg.capacity,
            scratch: cfg.scratch,
            multi_writer: cfg.writers == WriterMode::Multi,
            readers: stats.readers,
            writers: stats.writers,
        })
    }
}

impl HalStore {
    /// Attach to store ring `name`.
    ///
    /// The handle stays usable while the ring exists; `ring_delete` refuses
    /// rings with attached readers or writers.
    pub fn ring_attach(&self, name: &str) -> HalResult<RingBuffer> {
        let g = self.lock()?;
        let r = g.lookup(ObjectType::Ring, name)?;
        g.ring_view(r)
    }
}
