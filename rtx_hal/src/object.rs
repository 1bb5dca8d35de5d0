//! Object headers, names and filters.

use crate::error::{HalError, HalResult};
use bitflags::bitflags;
use rtx_common::consts::HAL_NAME_LEN;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Type tag of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// Component.
    Component = 1,
    /// Instance of an instantiable component.
    Instance = 2,
    /// Pin.
    Pin = 3,
    /// Parameter.
    Param = 4,
    /// Signal.
    Signal = 5,
    /// Thread.
    Thread = 6,
    /// Function.
    Function = 7,
    /// Ring.
    Ring = 8,
    /// Group.
    Group = 9,
    /// Group member.
    Member = 10,
}

impl ObjectType {
    /// All types, in listing order.
    pub const ALL: [ObjectType; 10] = [
        ObjectType::Component,
        ObjectType::Instance,
        ObjectType::Pin,
        ObjectType::Param,
        ObjectType::Signal,
        ObjectType::Thread,
        ObjectType::Function,
        ObjectType::Ring,
        ObjectType::Group,
        ObjectType::Member,
    ];

    /// Short name used in commands and messages.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::Component => "comp",
            ObjectType::Instance => "inst",
            ObjectType::Pin => "pin",
            ObjectType::Param => "param",
            ObjectType::Signal => "sig",
            ObjectType::Thread => "thread",
            ObjectType::Function => "funct",
            ObjectType::Ring => "ring",
            ObjectType::Group => "group",
            ObjectType::Member => "member",
        }
    }

    /// Parse a short name (a trailing `s` is accepted).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_suffix('s').filter(|r| !r.is_empty()).unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || (s == "signal" && *t == ObjectType::Signal))
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == v)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Memory ordering hints for value accesses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u8 {
        /// Full fence before reads.
        const RMB = 1 << 0;
        /// Full fence after writes.
        const WMB = 1 << 1;
    }
}

/// NUL padded object name.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HalName([u8; HAL_NAME_LEN]);

impl HalName {
    /// Validate and store `name`: 1 to 47 bytes, no whitespace.
    pub fn new(name: &str) -> HalResult<Self> {
        if name.is_empty()
            || name.len() >= HAL_NAME_LEN
            || name.chars().any(|c| c.is_whitespace() || c == '#')
        {
            return Err(HalError::InvalidName {
                name: name.to_string(),
            });
        }
        let mut buf = [0u8; HAL_NAME_LEN];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self(buf))
    }

    /// Name as text.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(HAL_NAME_LEN);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl fmt::Debug for HalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Common prefix of every object in the store.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    pub(crate) id: u32,
    pub(crate) object_type: u8,
    pub(crate) flags: AtomicU8,
    _pad: u16,
    pub(crate) owner_id: u32,
    pub(crate) refcnt: AtomicU32,
    pub(crate) name: HalName,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ObjectHeader>(), 64);

impl ObjectHeader {
    pub(crate) fn new(id: u32, object_type: ObjectType, owner_id: u32, name: HalName) -> Self {
        Self {
            id,
            object_type: object_type as u8,
            flags: AtomicU8::new(0),
            _pad: 0,
            owner_id,
            refcnt: AtomicU32::new(0),
            name,
        }
    }

    /// Session-unique id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Type tag.
    pub fn object_type(&self) -> Option<ObjectType> {
        ObjectType::from_u8(self.object_type)
    }

    /// Id of the owning object, `0` for none.
    pub fn owner_id(&self) -> u32 {
        self.owner_id
    }

    /// Number of references held by other objects.
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Memory ordering hints.
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }
}

/// Object layouts stored in the arena.
///
/// # Safety
///
/// Implementors are `#[repr(C)]`, start with an [`ObjectHeader`] and have an
/// alignment of at most 8. Fields changed after creation are atomics: objects
/// are only ever borrowed shared, realtime threads read them concurrently.
pub unsafe trait HalObject: Sized {
    /// Type tag written into the header.
    const TYPE: ObjectType;
}

/// Handle to a live object: id plus heap offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object id.
    pub id: u32,
    /// Offset of the object inside the store.
    pub off: u32,
    /// Type tag.
    pub object_type: ObjectType,
}

/// Result of a foreach callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Keep going.
    Continue,
    /// Stop the iteration.
    Stop,
}

/// Selection criteria for foreach.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    /// Only this type.
    pub object_type: Option<ObjectType>,
    /// Only objects owned by this id.
    pub owner_id: Option<u32>,
    /// Only names matching this glob.
    pub pattern: Option<String>,
}

impl ObjectFilter {
    /// All objects of `ty`.
    pub fn of_type(ty: ObjectType) -> Self {
        Self {
            object_type: Some(ty),
            ..Default::default()
        }
    }

    /// Restrict to an owner.
    pub fn owned_by(mut self, owner_id: u32) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Restrict to names matching `pattern`.
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Whether `hdr` passes the filter.
    pub fn matches(&self, hdr: &ObjectHeader) -> bool {
        self.object_type.is_none_or(|t| t as u8 == hdr.object_type)
            && self.owner_id.is_none_or(|o| o == hdr.owner_id)
            && self
                .pattern
                .as_deref()
                .is_none_or(|p| glob_match(p, hdr.name()))
    }
}

/// Shell-style match supporting `*`, `?` and `[...]` classes (with `!` negation and ranges).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    glob_at(&p, &n)
}

fn glob_at(p: &[char], n: &[char]) -> bool {
    match p.first() {
        None => n.is_empty(),
        Some('*') => (0..=n.len()).any(|i| glob_at(&p[1..], &n[i..])),
        Some('?') => !n.is_empty() && glob_at(&p[1..], &n[1..]),
        Some('[') => {
            let Some(close) = p.iter().skip(1).position(|&c| c == ']').map(|i| i + 1) else {
                return n.first() == Some(&'[') && glob_at(&p[1..], &n[1..]);
            };
            let Some(&c) = n.first() else { return false };
            let mut class = &p[1..close];
            let negate = class.first() == Some(&'!');
            if negate {
                class = &class[1..];
            }
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    hit |= (class[i]..=class[i + 2]).contains(&c);
                    i += 3;
                } else {
                    hit |= class[i] == c;
                    i += 1;
                }
            }
            hit != negate && glob_at(&p[close + 1..], &n[1..])
        }
        Some(&c) => n.first() == Some(&c) && glob_at(&p[1..], &n[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert_eq!(HalName::new("scale.0.gain").unwrap().as_str(), "scale.0.gain");
        assert!(HalName::new("").is_err());
        assert!(HalName::new("has space").is_err());
        assert!(HalName::new(&"x".repeat(47)).is_ok());
        assert!(HalName::new(&"x".repeat(48)).is_err());
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("scale.*.gain", "scale.0.gain"));
        assert!(!glob_match("scale.*.gain", "scale.0.offset"));
        assert!(glob_match("axis.?", "axis.x"));
        assert!(glob_match("axis.[xy]", "axis.y"));
        assert!(!glob_match("axis.[!xy]", "axis.y"));
        assert!(glob_match("j[0-2]", "j1"));
        assert!(!glob_match("j[0-2]", "j3"));
    }

    #[test]
    fn type_names() {
        assert_eq!(ObjectType::parse("pins"), Some(ObjectType::Pin));
        assert_eq!(ObjectType::parse("signal"), Some(ObjectType::Signal));
        assert_eq!(ObjectType::parse("sig"), Some(ObjectType::Signal));
        assert_eq!(ObjectType::parse("bogus"), None);
    }
}
