//! Segment keys.
//!
//! A key is `base | instance << 24`: the low 24 bits name the purpose of the
//! segment, the high byte the instance, so independent sessions coexist on
//! one host.

use rtx_common::consts::{
    GLOBAL_KEY, HAL_KEY, INSTANCE_SHIFT, PURPOSE_MASK, RING_KEY_BASE, RTAPI_KEY, SHM_PREFIX,
};
use std::fmt;

/// What a segment is used for, derived from the key's purpose bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPurpose {
    /// Global session segment.
    Global,
    /// Scheduler bookkeeping.
    Rtapi,
    /// Object store.
    Hal,
    /// Named ring.
    Ring,
    /// Anything else.
    Other,
}

/// Identifier of a shared memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey(u32);

impl SegmentKey {
    /// Combine a purpose base with an instance id.
    pub const fn new(base: u32, instance: u8) -> Self {
        Self((base & PURPOSE_MASK) | ((instance as u32) << INSTANCE_SHIFT))
    }

    /// Wrap a raw key.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Global session segment of `instance`.
    pub const fn global(instance: u8) -> Self {
        Self::new(GLOBAL_KEY, instance)
    }

    /// Scheduler bookkeeping segment of `instance`.
    pub const fn rtapi(instance: u8) -> Self {
        Self::new(RTAPI_KEY, instance)
    }

    /// Object store segment of `instance`.
    pub const fn hal(instance: u8) -> Self {
        Self::new(HAL_KEY, instance)
    }

    /// Segment of the named ring `name` in `instance`.
    pub fn ring(name: &str, instance: u8) -> Self {
        Self::new(RING_KEY_BASE | fnv16(name), instance)
    }

    /// Raw 32-bit key.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Purpose bits.
    pub const fn base(self) -> u32 {
        self.0 & PURPOSE_MASK
    }

    /// Instance byte.
    pub const fn instance(self) -> u8 {
        (self.0 >> INSTANCE_SHIFT) as u8
    }

    /// Purpose classification.
    pub fn purpose(self) -> SegmentPurpose {
        match self.base() {
            GLOBAL_KEY => SegmentPurpose::Global,
            RTAPI_KEY => SegmentPurpose::Rtapi,
            HAL_KEY => SegmentPurpose::Hal,
            b if b & 0x00FF_0000 == RING_KEY_BASE => SegmentPurpose::Ring,
            _ => SegmentPurpose::Other,
        }
    }

    /// File name under the segment directory.
    pub fn file_name(self) -> String {
        format!("{}-{:08x}", SHM_PREFIX, self.0)
    }

    /// Parse a file name produced by [`SegmentKey::file_name`].
    pub fn from_file_name(name: &str) -> Option<Self> {
        let hex = name.strip_prefix(SHM_PREFIX)?.strip_prefix('-')?;
        if hex.len() != 8 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// 32-bit FNV-1a folded to 16 bits.
fn fnv16(name: &str) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for b in name.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash >> 16) ^ (hash & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_lives_in_high_byte() {
        let key = SegmentKey::hal(3);
        assert_eq!(key.raw(), 0x0341_4C32);
        assert_eq!(key.instance(), 3);
        assert_eq!(key.base(), HAL_KEY);
        assert_eq!(key.purpose(), SegmentPurpose::Hal);
    }

    #[test]
    fn instances_do_not_collide() {
        assert_ne!(SegmentKey::global(0), SegmentKey::global(1));
        assert_eq!(SegmentKey::global(0).base(), SegmentKey::global(1).base());
    }

    #[test]
    fn ring_keys_are_stable_and_classified() {
        let a = SegmentKey::ring("telemetry", 0);
        assert_eq!(a, SegmentKey::ring("telemetry", 0));
        assert_eq!(a.purpose(), SegmentPurpose::Ring);
        assert_eq!(SegmentKey::ring("telemetry", 2).instance(), 2);
    }

    #[test]
    fn file_name_round_trips() {
        let key = SegmentKey::global(5);
        assert_eq!(key.file_name(), "rtx-05154711");
        assert_eq!(SegmentKey::from_file_name(&key.file_name()), Some(key));
        assert_eq!(SegmentKey::from_file_name("rtx-zz"), None);
        assert_eq!(SegmentKey::from_file_name(".rtx-05154711.tmp"), None);
    }
}
