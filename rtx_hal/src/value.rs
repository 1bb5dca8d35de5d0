//! Value types and atomic value cells

use crate::error::{HalError, HalResult};
use crate::object::ObjectFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Value type of pins, params and signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HalType {
    /// Boolean.
    Bit = 1,
    /// 64-bit float.
    Float = 2,
    /// Signed 32-bit.
    S32 = 3,
    /// Unsigned 32-bit.
    U32 = 4,
    /// Signed 64-bit.
    S64 = 5,
    /// Unsigned 64-bit.
    U64 = 6,
}

impl HalType {
    /// Name used in commands.
    pub fn as_str(self) -> &'static str {
        match self {
            HalType::Bit => "bit",
            HalType::Float => "float",
            HalType::S32 => "s32",
            HalType::U32 => "u32",
            HalType::S64 => "s64",
            HalType::U64 => "u64",
        }
    }

    /// Parse a command name.
    pub fn parse(s: &str) -> HalResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bit" => Ok(HalType::Bit),
            "float" => Ok(HalType::Float),
            "s32" => Ok(HalType::S32),
            "u32" => Ok(HalType::U32),
            "s64" => Ok(HalType::S64),
            "u64" => Ok(HalType::U64),
            _ => Err(HalError::InvalidArgument(format!("unknown type '{s}'"))),
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => HalType::Bit,
            3 => HalType::S32,
            4 => HalType::U32,
            5 => HalType::S64,
            6 => HalType::U64,
            _ => HalType::Float,
        }
    }
}

impl fmt::Display for HalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PinDir {
    /// Reads the signal.
    In = 16,
    /// Drives the signal.
    Out = 32,
    /// Reads and drives the signal.
    Io = 48,
}

impl PinDir {
    /// Name used in commands.
    pub fn as_str(self) -> &'static str {
        match self {
            PinDir::In => "in",
            PinDir::Out => "out",
            PinDir::Io => "io",
        }
    }

    /// Parse a command name.
    pub fn parse(s: &str) -> HalResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(PinDir::In),
            "out" => Ok(PinDir::Out),
            "io" => Ok(PinDir::Io),
            _ => Err(HalError::InvalidArgument(format!("unknown direction '{s}'"))),
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            32 => PinDir::Out,
            48 => PinDir::Io,
            _ => PinDir::In,
        }
    }
}

impl fmt::Display for PinDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Param direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParamDir {
    /// Only the owner writes.
    Ro = 64,
    /// Anyone writes.
    Rw = 192,
}

impl ParamDir {
    /// Name used in commands.
    pub fn as_str(self) -> &'static str {
        match self {
            ParamDir::Ro => "ro",
            ParamDir::Rw => "rw",
        }
    }

    /// Parse a command name.
    pub fn parse(s: &str) -> HalResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Ok(ParamDir::Ro),
            "rw" => Ok(ParamDir::Rw),
            _ => Err(HalError::InvalidArgument(format!("unknown param direction '{s}'"))),
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        if v == 64 { ParamDir::Ro } else { ParamDir::Rw }
    }
}

/// A typed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HalValue {
    /// Boolean.
    Bit(bool),
    /// 64-bit float.
    Float(f64),
    /// Signed 32-bit.
    S32(i32),
    /// Unsigned 32-bit.
    U32(u32),
    /// Signed 64-bit.
    S64(i64),
    /// Unsigned 64-bit.
    U64(u64),
}

impl HalValue {
    /// Zero of `ty`.
    pub fn zero(ty: HalType) -> Self {
        Self::from_bits(ty, 0)
    }

    /// Type of the value.
    pub fn hal_type(&self) -> HalType {
        match self {
            HalValue::Bit(_) => HalType::Bit,
            HalValue::Float(_) => HalType::Float,
            HalValue::S32(_) => HalType::S32,
            HalValue::U32(_) => HalType::U32,
            HalValue::S64(_) => HalType::S64,
            HalValue::U64(_) => HalType::U64,
        }
    }

    /// Cell representation.
    pub fn to_bits(self) -> u64 {
        match self {
            HalValue::Bit(b) => b as u64,
            HalValue::Float(f) => f.to_bits(),
            HalValue::S32(v) => v as u32 as u64,
            HalValue::U32(v) => v as u64,
            HalValue::S64(v) => v as u64,
            HalValue::U64(v) => v,
        }
    }

    /// Value of `ty` from its cell representation.
    pub fn from_bits(ty: HalType, bits: u64) -> Self {
        match ty {
            HalType::Bit => HalValue::Bit(bits != 0),
            HalType::Float => HalValue::Float(f64::from_bits(bits)),
            HalType::S32 => HalValue::S32(bits as u32 as i32),
            HalType::U32 => HalValue::U32(bits as u32),
            HalType::S64 => HalValue::S64(bits as i64),
            HalType::U64 => HalValue::U64(bits),
        }
    }

    /// Parse text as a value of `ty`. Integers accept a `0x` prefix.
    pub fn parse(ty: HalType, s: &str) -> HalResult<Self> {
        let bad = || HalError::InvalidArgument(format!("'{s}' is not a valid {ty}"));
        fn int<T: TryFrom<i128>>(s: &str) -> Option<T> {
            parse_int(s).and_then(|v| T::try_from(v).ok())
        }
        let s = s.trim();
        Ok(match ty {
            HalType::Bit => match s.to_ascii_lowercase().as_str() {
                "1" | "true" => HalValue::Bit(true),
                "0" | "false" => HalValue::Bit(false),
                _ => return Err(bad()),
            },
            HalType::Float => HalValue::Float(s.parse().map_err(|_| bad())?),
            HalType::S32 => HalValue::S32(int(s).ok_or_else(bad)?),
            HalType::U32 => HalValue::U32(int(s).ok_or_else(bad)?),
            HalType::S64 => HalValue::S64(int(s).ok_or_else(bad)?),
            HalType::U64 => HalValue::U64(int(s).ok_or_else(bad)?),
        })
    }

    /// Float view (bits become 0.0/1.0).
    pub fn as_f64(&self) -> f64 {
        match *self {
            HalValue::Bit(b) => b as u8 as f64,
            HalValue::Float(f) => f,
            HalValue::S32(v) => v as f64,
            HalValue::U32(v) => v as f64,
            HalValue::S64(v) => v as f64,
            HalValue::U64(v) => v as f64,
        }
    }

    /// Whether `self` differs from `other`; floats differ by more than `eps`.
    pub fn differs(&self, other: &HalValue, eps: f64) -> bool {
        match (self, other) {
            (HalValue::Float(a), HalValue::Float(b)) => (a - b).abs() > eps,
            _ => self.to_bits() != other.to_bits(),
        }
    }
}

// Decimal or 0x-prefixed hex, optionally negative.
fn parse_int(s: &str) -> Option<i128> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => body.parse::<u64>().ok()?,
    } as i128;
    Some(if neg { -magnitude } else { magnitude })
}

impl fmt::Display for HalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalValue::Bit(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            HalValue::Float(v) => write!(f, "{v}"),
            HalValue::S32(v) => write!(f, "{v}"),
            HalValue::U32(v) => write!(f, "{v}"),
            HalValue::S64(v) => write!(f, "{v}"),
            HalValue::U64(v) => write!(f, "{v}"),
        }
    }
}

/// 8-byte value cell in shared memory.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct ValueCell(AtomicU64);

static_assertions::const_assert_eq!(std::mem::size_of::<ValueCell>(), 8);

impl ValueCell {
    /// Read as `ty`, with a full fence first if `barriers` asks for it.
    pub fn load(&self, ty: HalType, barriers: ObjectFlags) -> HalValue {
        if barriers.contains(ObjectFlags::RMB) {
            fence(Ordering::SeqCst);
        }
        HalValue::from_bits(ty, self.0.load(Ordering::Acquire))
    }

    /// Write `value`, with a full fence afterwards if `barriers` asks for it.
    pub fn store(&self, value: HalValue, barriers: ObjectFlags) {
        self.0.store(value.to_bits(), Ordering::Release);
        if barriers.contains(ObjectFlags::WMB) {
            fence(Ordering::SeqCst);
        }
    }

    /// Raw cell contents.
    pub fn bits(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set_bits(&self, bits: u64) {
        self.0.store(bits, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_values() {
        assert_eq!(HalValue::parse(HalType::Bit, "TRUE").unwrap(), HalValue::Bit(true));
        assert_eq!(HalValue::parse(HalType::S32, "-0x10").unwrap(), HalValue::S32(-16));
        assert_eq!(HalValue::parse(HalType::U32, "42").unwrap(), HalValue::U32(42));
        assert!(HalValue::parse(HalType::U32, "-1").is_err());
        assert!(HalValue::parse(HalType::S32, "4294967296").is_err());
        assert_eq!(HalValue::parse(HalType::Float, "2.5").unwrap(), HalValue::Float(2.5));
        assert!(HalValue::parse(HalType::Bit, "2").is_err());
    }

    #[test]
    fn bits_preserve_sign() {
        let v = HalValue::S32(-5);
        assert_eq!(HalValue::from_bits(HalType::S32, v.to_bits()), v);
        let v = HalValue::S64(i64::MIN);
        assert_eq!(HalValue::from_bits(HalType::S64, v.to_bits()), v);
    }

    #[test]
    fn float_difference_uses_epsilon() {
        let a = HalValue::Float(1.0);
        assert!(!a.differs(&HalValue::Float(1.000001), 1e-5));
        assert!(a.differs(&HalValue::Float(1.001), 1e-5));
        assert!(HalValue::S32(1).differs(&HalValue::S32(2), 100.0));
    }

    #[test]
    fn cell_with_barriers() {
        let c = ValueCell::default();
        c.store(HalValue::Float(3.5), ObjectFlags::WMB);
        assert_eq!(c.load(HalType::Float, ObjectFlags::RMB), HalValue::Float(3.5));
        assert_eq!(c.load(HalType::Bit, ObjectFlags::empty()), HalValue::Bit(true));
    }
}
