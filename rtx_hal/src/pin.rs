//! Pins and parameters.
//!
//! A pin reads and writes through `value_off`: the value cell of its signal
//! while linked, its own dummy cell otherwise. Realtime code holds a
//! [`PinRef`] and never takes the store mutex.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectFlags, ObjectHeader, ObjectRef, ObjectType};
use crate::store::{HalGuard, HalStore};
use crate::value::{HalType, HalValue, ParamDir, PinDir, ValueCell};
use rtx_common::consts::MAX_EPSILON;
use serde::Serialize;
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Pin record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct PinObject {
    pub(crate) hdr: ObjectHeader,
    hal_type: u8,
    dir: u8,
    eps_index: u8,
    _pad: u8,
    pub(crate) signal_id: AtomicU32,
    pub(crate) value_off: AtomicU32,
    _pad2: u32,
    pub(crate) dummy: ValueCell,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for PinObject {
    const TYPE: ObjectType = ObjectType::Pin;
}

impl PinObject {
    /// Value type.
    pub fn hal_type(&self) -> HalType {
        HalType::from_u8(self.hal_type)
    }

    /// Direction.
    pub fn dir(&self) -> PinDir {
        PinDir::from_u8(self.dir)
    }

    /// Epsilon table index for change detection.
    pub fn eps_index(&self) -> u8 {
        self.eps_index
    }

    /// Id of the linked signal, `0` when unlinked.
    pub fn signal_id(&self) -> u32 {
        self.signal_id.load(Ordering::Acquire)
    }

    pub(crate) fn dummy_off(pin_off: u32) -> u32 {
        pin_off + offset_of!(PinObject, dummy) as u32
    }
}

/// Parameter record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct ParamObject {
    pub(crate) hdr: ObjectHeader,
    hal_type: u8,
    dir: u8,
    _pad: [u8; 6],
    value: ValueCell,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for ParamObject {
    const TYPE: ObjectType = ObjectType::Param;
}

impl ParamObject {
    /// Value type.
    pub fn hal_type(&self) -> HalType {
        HalType::from_u8(self.hal_type)
    }

    /// Access mode.
    pub fn dir(&self) -> ParamDir {
        ParamDir::from_u8(self.dir)
    }
}

/// Snapshot of a pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinInfo {
    /// Pin name.
    pub name: String,
    /// Object id.
    pub id: u32,
    /// Owning component or instance.
    pub owner: String,
    /// Value type.
    pub hal_type: HalType,
    /// Direction.
    pub dir: PinDir,
    /// Linked signal.
    pub signal: Option<String>,
    /// Current value.
    pub value: HalValue,
    /// Epsilon index.
    pub eps_index: u8,
}

/// Snapshot of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamInfo {
    /// Param name.
    pub name: String,
    /// Owning component or instance.
    pub owner: String,
    /// Value type.
    pub hal_type: HalType,
    /// Access mode.
    pub dir: ParamDir,
    /// Current value.
    pub value: HalValue,
}

impl HalGuard<'_> {
    fn check_owner(&self, owner: ObjectRef) -> HalResult<()> {
        match owner.object_type {
            ObjectType::Component | ObjectType::Instance => Ok(()),
            other => Err(HalError::InvalidArgument(format!(
                "a {other} cannot own pins or params"
            ))),
        }
    }

    /// Create a pin owned by a component or instance.
    pub fn pin_new(
        &mut self,
        owner: ObjectRef,
        name: &str,
        hal_type: HalType,
        dir: PinDir,
        eps_index: u8,
    ) -> HalResult<ObjectRef> {
        self.check_owner(owner)?;
        if eps_index as usize >= MAX_EPSILON {
            return Err(HalError::InvalidArgument(format!(
                "epsilon index {eps_index} >= {MAX_EPSILON}"
            )));
        }
        let r = self.insert(name, owner.id, |hdr| PinObject {
            hdr,
            hal_type: hal_type as u8,
            dir: dir as u8,
            eps_index,
            _pad: 0,
            signal_id: AtomicU32::new(0),
            value_off: AtomicU32::new(0),
            _pad2: 0,
            dummy: ValueCell::default(),
        })?;
        self.get::<PinObject>(r)
            .value_off
            .store(PinObject::dummy_off(r.off), Ordering::Release);
        debug!("Pin '{}' created ({} {})", name, hal_type, dir);
        Ok(r)
    }

    /// Unlink and delete a pin.
    pub fn pin_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Pin, name)?;
        self.unlink(name)?;
        self.remove(r)
    }

    pub(crate) fn pin(&self, name: &str) -> HalResult<(ObjectRef, &PinObject)> {
        let r = self.lookup(ObjectType::Pin, name)?;
        Ok((r, self.get::<PinObject>(r)))
    }

    fn value_flags(&self, r: ObjectRef) -> ObjectFlags {
        self.header(r).flags()
    }

    /// Current value of a pin.
    pub fn pin_get(&self, name: &str) -> HalResult<HalValue> {
        let (r, p) = self.pin(name)?;
        let cell = self.store().cell(p.value_off.load(Ordering::Acquire));
        Ok(cell.load(p.hal_type(), self.value_flags(r)))
    }

    /// Snapshot of a pin.
    pub fn pin_info(&self, name: &str) -> HalResult<PinInfo> {
        let (r, p) = self.pin(name)?;
        let sig = p.signal_id();
        Ok(PinInfo {
            name: name.to_string(),
            id: r.id,
            owner: self.name_of(self.header(r).owner_id()),
            hal_type: p.hal_type(),
            dir: p.dir(),
            signal: (sig != 0).then(|| self.name_of(sig)),
            value: self.pin_get(name)?,
            eps_index: p.eps_index(),
        })
    }

    /// Create a parameter, initialised to `init` or zero.
    pub fn param_new(
        &mut self,
        owner: ObjectRef,
        name: &str,
        hal_type: HalType,
        dir: ParamDir,
        init: Option<HalValue>,
    ) -> HalResult<ObjectRef> {
        self.check_owner(owner)?;
        let value = ValueCell::default();
        if let Some(v) = init {
            if v.hal_type() != hal_type {
                return Err(HalError::InvalidArgument(format!(
                    "initial value of '{name}' is {}, expected {hal_type}",
                    v.hal_type()
                )));
            }
            value.set_bits(v.to_bits());
        }
        self.insert(name, owner.id, |hdr| ParamObject {
            hdr,
            hal_type: hal_type as u8,
            dir: dir as u8,
            _pad: [0; 6],
            value,
        })
    }

    /// Delete a parameter.
    pub fn param_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Param, name)?;
        self.remove(r)
    }

    fn param(&self, name: &str) -> HalResult<(ObjectRef, &ParamObject)> {
        let r = self.lookup(ObjectType::Param, name)?;
        Ok((r, self.get::<ParamObject>(r)))
    }

    /// Current value of a parameter.
    pub fn param_get(&self, name: &str) -> HalResult<HalValue> {
        let (r, p) = self.param(name)?;
        Ok(p.value.load(p.hal_type(), self.value_flags(r)))
    }

    /// Set a read-write parameter.
    pub fn param_set(&mut self, name: &str, value: HalValue) -> HalResult<()> {
        let (r, p) = self.param(name)?;
        if p.dir() == ParamDir::Ro {
            return Err(HalError::ReadOnly {
                name: name.to_string(),
                reason: "read-only parameter",
            });
        }
        check_type(name, p.hal_type(), value)?;
        p.value.store(value, self.value_flags(r));
        Ok(())
    }

    /// Snapshot of a parameter.
    pub fn param_info(&self, name: &str) -> HalResult<ParamInfo> {
        let (r, p) = self.param(name)?;
        Ok(ParamInfo {
            name: name.to_string(),
            owner: self.name_of(self.header(r).owner_id()),
            hal_type: p.hal_type(),
            dir: p.dir(),
            value: self.param_get(name)?,
        })
    }

    /// Set a param, or an unlinked input pin, from text.
    ///
    /// Output pins and linked pins are refused: their value belongs to a
    /// writer or to the signal.
    pub fn setp(&mut self, name: &str, text: &str) -> HalResult<HalValue> {
        if let Some(r) = self.find(ObjectType::Pin, name) {
            let p = self.get::<PinObject>(r);
            if p.dir() == PinDir::Out {
                return Err(HalError::ReadOnly {
                    name: name.to_string(),
                    reason: "output pin",
                });
            }
            if p.signal_id() != 0 {
                return Err(HalError::ReadOnly {
                    name: name.to_string(),
                    reason: "pin is linked to a signal",
                });
            }
            let value = HalValue::parse(p.hal_type(), text)?;
            p.dummy.store(value, self.value_flags(r));
            return Ok(value);
        }
        let (_, p) = self.param(name)?;
        let value = HalValue::parse(p.hal_type(), text)?;
        self.param_set(name, value)?;
        Ok(value)
    }
}

pub(crate) fn check_type(name: &str, expected: HalType, value: HalValue) -> HalResult<()> {
    if value.hal_type() != expected {
        return Err(HalError::InvalidArgument(format!(
            "'{name}' is {expected}, got a {} value",
            value.hal_type()
        )));
    }
    Ok(())
}

/// Lock-free handle on a pin for realtime code.
///
/// Valid while the pin exists; owners delete their functions before their pins.
#[derive(Clone)]
pub struct PinRef {
    store: Arc<HalStore>,
    off: u32,
    hal_type: HalType,
    flags: ObjectFlags,
}

impl PinRef {
    fn pin(&self) -> &PinObject {
        self.store.object::<PinObject>(self.off)
    }

    fn cell(&self) -> &ValueCell {
        self.store
            .cell(self.pin().value_off.load(Ordering::Acquire))
    }

    /// Value type.
    pub fn hal_type(&self) -> HalType {
        self.hal_type
    }

    /// Current value.
    pub fn get(&self) -> HalValue {
        self.cell().load(self.hal_type, self.flags)
    }

    /// Write a value; a value of another type is ignored.
    pub fn set(&self, value: HalValue) {
        if value.hal_type() == self.hal_type {
            self.cell().store(value, self.flags);
        }
    }

    /// Value as a float.
    pub fn f64(&self) -> f64 {
        self.get().as_f64()
    }

    /// Write a float pin.
    pub fn set_f64(&self, v: f64) {
        self.set(HalValue::Float(v));
    }

    /// Value as a bit (non-zero is true).
    pub fn bit(&self) -> bool {
        self.cell().bits() != 0
    }

    /// Write a bit pin.
    pub fn set_bit(&self, v: bool) {
        self.set(HalValue::Bit(v));
    }

    /// Value as a signed integer.
    pub fn i64(&self) -> i64 {
        match self.get() {
            HalValue::S32(v) => v as i64,
            HalValue::U32(v) => v as i64,
            HalValue::S64(v) => v,
            HalValue::U64(v) => v as i64,
            other => other.as_f64() as i64,
        }
    }
}

/// Lock-free handle on a parameter. Writes ignore the access mode.
#[derive(Clone)]
pub struct ParamRef {
    store: Arc<HalStore>,
    off: u32,
    hal_type: HalType,
}

impl ParamRef {
    fn cell(&self) -> &ValueCell {
        &self.store.object::<ParamObject>(self.off).value
    }

    /// Current value.
    pub fn get(&self) -> HalValue {
        self.cell().load(self.hal_type, ObjectFlags::empty())
    }

    /// Owner-side write.
    pub fn set(&self, value: HalValue) {
        if value.hal_type() == self.hal_type {
            self.cell().store(value, ObjectFlags::empty());
        }
    }

    /// Value as a float.
    pub fn f64(&self) -> f64 {
        self.get().as_f64()
    }
}

impl HalStore {
    /// Lock-free handle on pin `name`.
    pub fn pin_ref(self: &Arc<Self>, name: &str) -> HalResult<PinRef> {
        let g = self.lock()?;
        let (r, p) = g.pin(name)?;
        Ok(PinRef {
            store: Arc::clone(self),
            off: r.off,
            hal_type: p.hal_type(),
            flags: g.header(r).flags(),
        })
    }

    /// Lock-free handle on parameter `name`.
    pub fn param_ref(self: &Arc<Self>, name: &str) -> HalResult<ParamRef> {
        let g = self.lock()?;
        let (r, p) = g.param(name)?;
        Ok(ParamRef {
            store: Arc::clone(self),
            off: r.off,
            hal_type: p.hal_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp::CompKind;

    fn setup() -> Arc<HalStore> {
        let s = Arc::new(HalStore::in_memory(128 * 1024, 64).unwrap());
        {
            let mut g = s.lock().unwrap();
            let c = g.comp_new("m", CompKind::Realtime, 0).unwrap();
            g.pin_new(c, "m.in", HalType::Float, PinDir::In, 0).unwrap();
            g.pin_new(c, "m.out", HalType::Float, PinDir::Out, 1).unwrap();
            g.param_new(c, "m.gain", HalType::Float, ParamDir::Rw, Some(HalValue::Float(1.0)))
                .unwrap();
            g.param_new(c, "m.version", HalType::U32, ParamDir::Ro, Some(HalValue::U32(3)))
                .unwrap();
        }
        s
    }

    #[test]
    fn setp_rules() {
        let s = setup();
        let mut g = s.lock().unwrap();
        assert_eq!(g.setp("m.in", "2.5").unwrap(), HalValue::Float(2.5));
        assert_eq!(g.pin_get("m.in").unwrap(), HalValue::Float(2.5));
        assert!(matches!(g.setp("m.out", "1"), Err(HalError::ReadOnly { .. })));
        g.setp("m.gain", "4").unwrap();
        assert_eq!(g.param_get("m.gain").unwrap(), HalValue::Float(4.0));
        assert!(matches!(g.setp("m.version", "4"), Err(HalError::ReadOnly { .. })));
        assert!(matches!(g.setp("m.in", "abc"), Err(HalError::InvalidArgument(_))));
        assert!(matches!(g.setp("nope", "1"), Err(HalError::NotFound { .. })));

        g.net("x", &["m.in"]).unwrap();
        assert!(matches!(g.setp("m.in", "1"), Err(HalError::ReadOnly { .. })));
    }

    #[test]
    fn pin_ref_follows_link_changes() {
        let s = setup();
        let out = s.pin_ref("m.out").unwrap();
        let input = s.pin_ref("m.in").unwrap();
        out.set_f64(7.0);
        assert_eq!(input.f64(), 0.0);

        s.lock().unwrap().net("sig", &["m.out", "m.in"]).unwrap();
        out.set_f64(3.0);
        assert_eq!(input.f64(), 3.0);
        assert_eq!(s.lock().unwrap().signal_get("sig").unwrap(), HalValue::Float(3.0));

        s.lock().unwrap().unlink("m.in").unwrap();
        out.set_f64(9.0);
        assert_eq!(input.f64(), 3.0);
    }

    #[test]
    fn param_ref_writes_read_only_params() {
        let s = setup();
        let v = s.param_ref("m.version").unwrap();
        v.set(HalValue::U32(4));
        v.set(HalValue::Float(1.0));
        assert_eq!(s.lock().unwrap().param_get("m.version").unwrap(), HalValue::U32(4));
    }

    #[test]
    fn pin_info_reports_link() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("sig", &["m.out"]).unwrap();
        let info = g.pin_info("m.out").unwrap();
        assert_eq!(info.owner, "m");
        assert_eq!(info.signal.as_deref(), Some("sig"));
        assert_eq!(info.eps_index, 1);
        let m = g.lookup(ObjectType::Component, "m").unwrap();
        assert!(g.pin_new(m, "m.bad", HalType::Bit, PinDir::In, 9).is_err());
    }
}
