//! Segment discovery and orphan cleanup

use crate::error::ShmResult;
use crate::key::{SegmentKey, SegmentPurpose};
use crate::segment::{OwnerState, SegmentManager};
use rtx_common::consts::SEGMENT_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Segment metadata read from its header
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    /// Raw segment key
    pub key: u32,
    /// File name in the segment directory
    pub name: String,
    /// Segment user magic
    pub magic: u32,
    /// Layout version
    pub layout_version: u32,
    /// Data section size in bytes
    pub size: usize,
    /// Creator process ID
    pub owner_pid: u32,
    /// Whether the creator still holds the segment
    pub live: bool,
    /// Non-owner attachments
    pub attach_count: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

impl SegmentInfo {
    /// Typed key.
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::from_raw(self.key)
    }

    /// What the segment is used for.
    pub fn purpose(&self) -> SegmentPurpose {
        self.segment_key().purpose()
    }
}

/// Scans the segment directory of a [`SegmentManager`]
pub struct SegmentDiscovery<'a> {
    mgr: &'a SegmentManager,
}

impl<'a> SegmentDiscovery<'a> {
    /// Discovery over the directory of `mgr`
    pub fn new(mgr: &'a SegmentManager) -> Self {
        Self { mgr }
    }

    /// List all segments, oldest first
    pub fn list_segments(&self) -> ShmResult<Vec<SegmentInfo>> {
        let mut segments = Vec::new();
        if !self.mgr.dir().exists() {
            return Ok(segments);
        }
        for entry in std::fs::read_dir(self.mgr.dir())?.flatten() {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(key) = SegmentKey::from_file_name(&file_name) else {
                continue;
            };
            match self.read_info(key) {
                Ok(Some(info)) => segments.push(info),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable segment {}: {}", file_name, e),
            }
        }
        segments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(segments)
    }

    /// Segments of one instance
    pub fn list_instance(&self, instance: u8) -> ShmResult<Vec<SegmentInfo>> {
        Ok(self
            .list_segments()?
            .into_iter()
            .filter(|s| s.segment_key().instance() == instance)
            .collect())
    }

    /// Find the segment of `key`
    pub fn find_segment(&self, key: SegmentKey) -> ShmResult<Option<SegmentInfo>> {
        self.read_info(key)
    }

    /// Remove segments without a live owner. `None` covers all instances.
    pub fn cleanup_orphaned(&self, instance: Option<u8>) -> ShmResult<usize> {
        let mut cleaned = 0;
        for seg in self.list_segments()? {
            if instance.is_some_and(|i| seg.segment_key().instance() != i) {
                continue;
            }
            if let OwnerState::Stale { pid } = self.mgr.probe_owner(seg.segment_key())? {
                info!("Removing orphaned segment {} (creator pid {})", seg.name, pid);
                self.mgr.unlink(seg.segment_key())?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    /// Remove every segment of `instance`, live or not
    pub fn unlink_instance(&self, instance: u8) -> ShmResult<usize> {
        let segments = self.list_instance(instance)?;
        for seg in &segments {
            self.mgr.unlink(seg.segment_key())?;
        }
        Ok(segments.len())
    }

    fn read_info(&self, key: SegmentKey) -> ShmResult<Option<SegmentInfo>> {
        let path = self.mgr.path_for(key);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut hdr = [0u8; SEGMENT_HEADER_SIZE];
        if file.read_exact_at(&mut hdr, 0).is_err() {
            return Ok(None);
        }
        let u32_at = |o: usize| u32::from_ne_bytes([hdr[o], hdr[o + 1], hdr[o + 2], hdr[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&hdr[o..o + 8]);
            u64::from_ne_bytes(b)
        };
        let live = matches!(self.mgr.probe_owner(key)?, OwnerState::Live { .. });
        Ok(Some(SegmentInfo {
            key: key.raw(),
            name: key.file_name(),
            magic: u32_at(0),
            layout_version: u32_at(4),
            size: u64_at(16) as usize,
            owner_pid: u32_at(32),
            live,
            attach_count: u32_at(36),
            created_at: UNIX_EPOCH + Duration::from_nanos(u64_at(24)),
        }))
    }
}
