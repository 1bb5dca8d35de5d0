//! Groups of signals watched together, and their members.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectFilter, ObjectHeader, ObjectRef, ObjectType};
use crate::signal::SignalObject;
use crate::store::HalGuard;
use bitflags::bitflags;
use rtx_common::consts::MAX_EPSILON;
use serde::Serialize;
use std::sync::atomic::Ordering;
use tracing::debug;

bitflags! {
    /// Reporting options of a group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GroupFlags: u32 {
        /// Report only members whose value changed.
        const REPORT_ON_CHANGE = 1 << 0;
    }
}

/// Group record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct GroupObject {
    pub(crate) hdr: ObjectHeader,
    arg1: i32,
    flags: u32,
}

// SAFETY: repr(C), header first, no mutable fields.
unsafe impl HalObject for GroupObject {
    const TYPE: ObjectType = ObjectType::Group;
}

/// Member record: a signal watched by a group. Named `group:signal`.
#[repr(C)]
#[derive(Debug)]
pub struct MemberObject {
    pub(crate) hdr: ObjectHeader,
    sig_id: u32,
    arg1: i32,
    eps_index: u8,
    _pad: [u8; 7],
}

// SAFETY: repr(C), header first, no mutable fields.
unsafe impl HalObject for MemberObject {
    const TYPE: ObjectType = ObjectType::Member;
}

/// Snapshot of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// User argument.
    pub arg1: i32,
    /// Raw [`GroupFlags`].
    pub flags: u32,
    /// Members in creation order.
    pub members: Vec<MemberInfo>,
}

/// Snapshot of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    /// Watched signal.
    pub signal: String,
    /// User argument.
    pub arg1: i32,
    /// Epsilon index for float comparison.
    pub eps_index: u8,
}

pub(crate) fn member_name(group: &str, signal: &str) -> String {
    format!("{group}:{signal}")
}

impl HalGuard<'_> {
    /// Create an empty group.
    pub fn group_new(&mut self, name: &str, arg1: i32, flags: u32) -> HalResult<ObjectRef> {
        let flags = GroupFlags::from_bits(flags)
            .ok_or_else(|| HalError::InvalidArgument(format!("group flags {flags:#x}")))?;
        let r = self.insert(name, 0, |hdr| GroupObject {
            hdr,
            arg1,
            flags: flags.bits(),
        })?;
        debug!("Group '{}' created", name);
        Ok(r)
    }

    /// Delete a group and its members.
    pub fn group_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Group, name)?;
        for m in self.collect(&ObjectFilter::of_type(ObjectType::Member).owned_by(r.id)) {
            self.member_remove(m)?;
        }
        self.remove(r)
    }

    /// Watch `signal` in `group`.
    pub fn member_new(
        &mut self,
        group: &str,
        signal: &str,
        arg1: i32,
        eps_index: u8,
    ) -> HalResult<ObjectRef> {
        let g = self.lookup(ObjectType::Group, group)?;
        let (sr, _) = self.signal(signal)?;
        if eps_index as usize >= MAX_EPSILON {
            return Err(HalError::InvalidArgument(format!(
                "epsilon index {eps_index} >= {MAX_EPSILON}"
            )));
        }
        let r = self.insert(&member_name(group, signal), g.id, |hdr| MemberObject {
            hdr,
            sig_id: sr.id,
            arg1,
            eps_index,
            _pad: [0; 7],
        })?;
        self.get::<SignalObject>(sr)
            .hdr
            .refcnt
            .fetch_add(1, Ordering::Relaxed);
        Ok(r)
    }

    /// Stop watching `signal` in `group`.
    pub fn member_delete(&mut self, group: &str, signal: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Member, &member_name(group, signal))?;
        self.member_remove(r)
    }

    pub(crate) fn member_remove(&mut self, r: ObjectRef) -> HalResult<()> {
        let sig_id = self.get::<MemberObject>(r).sig_id;
        if let Some(sr) = self.find_by_id(sig_id) {
            self.get::<SignalObject>(sr)
                .hdr
                .refcnt
                .fetch_sub(1, Ordering::Relaxed);
        }
        self.remove(r)
    }

    /// Members of `group` in creation order, as refs with their signal refs.
    pub(crate) fn group_member_refs(&mut self, group: ObjectRef) -> Vec<(ObjectRef, ObjectRef)> {
        self.collect(&ObjectFilter::of_type(ObjectType::Member).owned_by(group.id))
            .into_iter()
            .filter_map(|m| {
                let sig = self.find_by_id(self.get::<MemberObject>(m).sig_id)?;
                Some((m, sig))
            })
            .collect()
    }

    pub(crate) fn member_eps(&self, m: ObjectRef) -> u8 {
        self.get::<MemberObject>(m).eps_index
    }

    /// Snapshot of a group with its members.
    pub fn group_info(&mut self, name: &str) -> HalResult<GroupInfo> {
        let r = self.lookup(ObjectType::Group, name)?;
        let members = self
            .group_member_refs(r)
            .into_iter()
            .map(|(m, s)| {
                let mo = self.get::<MemberObject>(m);
                MemberInfo {
                    signal: self.header(s).name().to_string(),
                    arg1: mo.arg1,
                    eps_index: mo.eps_index,
                }
            })
            .collect();
        let go = self.get::<GroupObject>(r);
        Ok(GroupInfo {
            name: name.to_string(),
            arg1: go.arg1,
            flags: go.flags,
            members,
        })
    }

    /// Flags of a group.
    pub fn group_flags(&self, group: ObjectRef) -> GroupFlags {
        GroupFlags::from_bits_truncate(self.get::<GroupObject>(group).flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HalStore;
    use crate::value::HalType;

    #[test]
    fn members_pin_their_signals() {
        let s = HalStore::in_memory(128 * 1024, 64).unwrap();
        let mut g = s.lock().unwrap();
        g.signal_new("x", HalType::Float).unwrap();
        g.signal_new("y", HalType::Bit).unwrap();
        g.group_new("axis", 7, GroupFlags::REPORT_ON_CHANGE.bits()).unwrap();
        g.member_new("axis", "x", 0, 2).unwrap();
        g.member_new("axis", "y", 1, 0).unwrap();
        assert!(matches!(
            g.member_new("axis", "x", 0, 0),
            Err(HalError::AlreadyExists { .. })
        ));
        assert!(matches!(g.signal_delete("x"), Err(HalError::InUse { .. })));

        let info = g.group_info("axis").unwrap();
        assert_eq!(info.arg1, 7);
        assert_eq!(
            info.members.iter().map(|m| m.signal.as_str()).collect::<Vec<_>>(),
            vec!["x", "y"]
        );
        assert_eq!(info.members[0].eps_index, 2);

        g.member_delete("axis", "x").unwrap();
        g.signal_delete("x").unwrap();
        g.group_delete("axis").unwrap();
        g.signal_delete("y").unwrap();
        assert_eq!(g.object_count(), 0);
    }

    #[test]
    fn bad_arguments() {
        let s = HalStore::in_memory(128 * 1024, 64).unwrap();
        let mut g = s.lock().unwrap();
        assert!(g.group_new("g", 0, 0x80).is_err());
        g.group_new("g", 0, 0).unwrap();
        assert!(matches!(
            g.member_new("g", "missing", 0, 0),
            Err(HalError::NotFound { .. })
        ));
        g.signal_new("s", HalType::U32).unwrap();
        assert!(g.member_new("g", "s", 0, 5).is_err());
    }
}
