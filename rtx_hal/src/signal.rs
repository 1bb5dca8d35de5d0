//! Signals and the linking protocol.
//!
//! A signal has any number of readers and at most one driver: either one
//! output pin or one bidirectional pin. [`HalGuard::net`] checks every pin
//! before linking any of them, so a rejected net changes nothing.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectFilter, ObjectHeader, ObjectRef, ObjectType, Visit};
use crate::pin::{PinObject, check_type};
use crate::store::HalGuard;
use crate::value::{HalType, HalValue, PinDir, ValueCell};
use serde::Serialize;
use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Signal record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct SignalObject {
    pub(crate) hdr: ObjectHeader,
    hal_type: u8,
    _pad: [u8; 3],
    readers: AtomicU32,
    writers: AtomicU32,
    bidirs: AtomicU32,
    pub(crate) value: ValueCell,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for SignalObject {
    const TYPE: ObjectType = ObjectType::Signal;
}

impl SignalObject {
    /// Value type.
    pub fn hal_type(&self) -> HalType {
        HalType::from_u8(self.hal_type)
    }

    /// Linked input pins.
    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Relaxed)
    }

    /// Linked output pins (0 or 1).
    pub fn writers(&self) -> u32 {
        self.writers.load(Ordering::Relaxed)
    }

    /// Linked bidirectional pins (0 or 1).
    pub fn bidirs(&self) -> u32 {
        self.bidirs.load(Ordering::Relaxed)
    }

    fn counter(&self, dir: PinDir) -> &AtomicU32 {
        match dir {
            PinDir::In => &self.readers,
            PinDir::Out => &self.writers,
            PinDir::Io => &self.bidirs,
        }
    }

    pub(crate) fn value_off(sig_off: u32) -> u32 {
        sig_off + offset_of!(SignalObject, value) as u32
    }
}

/// Snapshot of a signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalInfo {
    /// Signal name.
    pub name: String,
    /// Object id.
    pub id: u32,
    /// Value type.
    pub hal_type: HalType,
    /// Current value.
    pub value: HalValue,
    /// Linked input pins.
    pub readers: u32,
    /// Linked output pins.
    pub writers: u32,
    /// Linked bidirectional pins.
    pub bidirs: u32,
    /// Linked pins with their direction, in creation order.
    pub pins: Vec<(String, PinDir)>,
}

/// What a `net` command did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetOutcome {
    /// The signal was created by this net.
    pub created: bool,
    /// Pins newly linked.
    pub linked: Vec<String>,
    /// Pins already on the signal or listed twice.
    pub skipped: Vec<String>,
}

// Driver admission: an output or bidir pin needs a signal without a driver.
fn admit(signal: &str, pin: &str, dir: PinDir, writers: u32, bidirs: u32) -> HalResult<()> {
    if dir == PinDir::In {
        return Ok(());
    }
    let existing = if writers > 0 {
        "a writer"
    } else if bidirs > 0 {
        "a bidirectional pin"
    } else {
        return Ok(());
    };
    Err(HalError::CardinalityViolation {
        signal: signal.to_string(),
        pin: pin.to_string(),
        existing,
    })
}

impl HalGuard<'_> {
    /// Create an unlinked signal holding zero.
    pub fn signal_new(&mut self, name: &str, hal_type: HalType) -> HalResult<ObjectRef> {
        let r = self.insert(name, 0, |hdr| SignalObject {
            hdr,
            hal_type: hal_type as u8,
            _pad: [0; 3],
            readers: AtomicU32::new(0),
            writers: AtomicU32::new(0),
            bidirs: AtomicU32::new(0),
            value: ValueCell::default(),
        })?;
        debug!("Signal '{}' created ({})", name, hal_type);
        Ok(r)
    }

    pub(crate) fn signal(&self, name: &str) -> HalResult<(ObjectRef, &SignalObject)> {
        let r = self.lookup(ObjectType::Signal, name)?;
        Ok((r, self.get::<SignalObject>(r)))
    }

    /// Pins linked to signal `sig_id`, in creation order.
    pub fn signal_pins(&mut self, sig_id: u32) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        self.foreach(&ObjectFilter::of_type(ObjectType::Pin), |g, r| {
            if g.get::<PinObject>(r).signal_id() == sig_id {
                out.push(r);
            }
            Visit::Continue
        });
        out
    }

    /// Delete a signal, unlinking its pins first.
    ///
    /// A signal watched by a group member is in use and stays.
    pub fn signal_delete(&mut self, name: &str) -> HalResult<()> {
        let (r, s) = self.signal(name)?;
        if s.hdr.refcnt() > 0 {
            return Err(HalError::InUse {
                name: name.to_string(),
                reason: format!("member of {} group(s)", s.hdr.refcnt()),
            });
        }
        for pin in self.signal_pins(r.id) {
            let pin_name = self.header(pin).name().to_string();
            self.unlink(&pin_name)?;
        }
        self.remove(r)?;
        debug!("Signal '{}' deleted", name);
        Ok(())
    }

    /// Delete every signal, together with the group members watching them.
    pub fn signal_delete_all(&mut self) -> HalResult<usize> {
        for member in self.collect(&ObjectFilter::of_type(ObjectType::Member)) {
            self.member_remove(member)?;
        }
        let names = self.names(&ObjectFilter::of_type(ObjectType::Signal));
        for name in &names {
            self.signal_delete(name)?;
        }
        Ok(names.len())
    }

    /// Link `pin` to `signal`, breaking an existing link of the pin.
    ///
    /// Linking a pin to the signal it is already on is a no-op.
    pub fn link(&mut self, pin: &str, signal: &str) -> HalResult<()> {
        let (pr, p) = self.pin(pin)?;
        let (sr, s) = self.signal(signal)?;
        if p.signal_id() == sr.id {
            return Ok(());
        }
        if p.hal_type() != s.hal_type() {
            return Err(HalError::TypeMismatch {
                signal: signal.to_string(),
                pin: pin.to_string(),
                signal_type: s.hal_type().as_str(),
                pin_type: p.hal_type().as_str(),
            });
        }
        admit(signal, pin, p.dir(), s.writers(), s.bidirs())?;
        if p.signal_id() != 0 {
            self.unlink(pin)?;
        }
        let p = self.get::<PinObject>(pr);
        let s = self.get::<SignalObject>(sr);
        if p.dir() != PinDir::In {
            s.value.set_bits(p.dummy.bits());
        }
        s.counter(p.dir()).fetch_add(1, Ordering::Relaxed);
        p.signal_id.store(sr.id, Ordering::Release);
        p.value_off
            .store(SignalObject::value_off(sr.off), Ordering::Release);
        debug!("Linked pin '{}' to signal '{}'", pin, signal);
        Ok(())
    }

    /// Unlink `pin`. The pin keeps the signal's last value. Unlinked pins are left alone.
    pub fn unlink(&mut self, pin: &str) -> HalResult<()> {
        let (pr, p) = self.pin(pin)?;
        let sig_id = p.signal_id();
        if sig_id == 0 {
            return Ok(());
        }
        if let Some(sr) = self.find_by_id(sig_id) {
            let s = self.get::<SignalObject>(sr);
            p.dummy.set_bits(s.value.bits());
            s.counter(p.dir()).fetch_sub(1, Ordering::Relaxed);
        }
        p.value_off
            .store(PinObject::dummy_off(pr.off), Ordering::Release);
        p.signal_id.store(0, Ordering::Release);
        debug!("Unlinked pin '{}'", pin);
        Ok(())
    }

    /// Link `pins` to `signal`, creating it with the first pin's type if needed.
    ///
    /// All pins are checked before any is linked: type, existing links, and
    /// the single-driver rule counted over the whole list.
    pub fn net<S: AsRef<str>>(&mut self, signal: &str, pins: &[S]) -> HalResult<NetOutcome> {
        let first = pins.first().ok_or_else(|| {
            HalError::InvalidArgument(format!("net '{signal}' needs at least one pin"))
        })?;
        if pins.iter().any(|p| p.as_ref() == signal) {
            return Err(HalError::InvalidArgument(format!(
                "signal name '{signal}' equals a pin name"
            )));
        }

        let existing = self.find(ObjectType::Signal, signal);
        let (sig_id, sig_type, mut writers, mut bidirs) = match existing {
            Some(sr) => {
                let s = self.get::<SignalObject>(sr);
                (sr.id, s.hal_type(), s.writers(), s.bidirs())
            }
            None => (0, self.pin(first.as_ref())?.1.hal_type(), 0, 0),
        };

        let mut outcome = NetOutcome {
            created: existing.is_none(),
            ..Default::default()
        };
        let mut plan: Vec<&str> = Vec::with_capacity(pins.len());
        for name in pins.iter().map(AsRef::as_ref) {
            if plan.contains(&name) || outcome.skipped.iter().any(|s| s == name) {
                outcome.skipped.push(name.to_string());
                continue;
            }
            let (_, p) = self.pin(name)?;
            let linked = p.signal_id();
            if sig_id != 0 && linked == sig_id {
                outcome.skipped.push(name.to_string());
                continue;
            }
            if linked != 0 {
                return Err(HalError::AlreadyLinked {
                    pin: name.to_string(),
                    signal: self.name_of(linked),
                });
            }
            if p.hal_type() != sig_type {
                return Err(HalError::TypeMismatch {
                    signal: signal.to_string(),
                    pin: name.to_string(),
                    signal_type: sig_type.as_str(),
                    pin_type: p.hal_type().as_str(),
                });
            }
            admit(signal, name, p.dir(), writers, bidirs)?;
            match p.dir() {
                PinDir::Out => writers += 1,
                PinDir::Io => bidirs += 1,
                PinDir::In => {}
            }
            plan.push(name);
        }

        if existing.is_none() {
            self.signal_new(signal, sig_type)?;
        }
        for name in plan {
            self.link(name, signal)?;
            outcome.linked.push(name.to_string());
        }
        Ok(outcome)
    }

    /// Set a signal that has no writer.
    pub fn signal_set(&mut self, name: &str, value: HalValue) -> HalResult<()> {
        let (_, s) = self.signal(name)?;
        if s.writers() > 0 {
            return Err(HalError::ReadOnly {
                name: name.to_string(),
                reason: "signal has a writer",
            });
        }
        check_type(name, s.hal_type(), value)?;
        s.value.store(value, s.hdr.flags());
        Ok(())
    }

    /// Parse `text` as the signal's type and set it.
    pub fn sets(&mut self, name: &str, text: &str) -> HalResult<HalValue> {
        let ty = self.signal(name)?.1.hal_type();
        let value = HalValue::parse(ty, text)?;
        self.signal_set(name, value)?;
        Ok(value)
    }

    /// Current value of a signal.
    pub fn signal_get(&self, name: &str) -> HalResult<HalValue> {
        let (_, s) = self.signal(name)?;
        Ok(s.value.load(s.hal_type(), s.hdr.flags()))
    }

    /// Snapshot of a signal with its pins.
    pub fn signal_info(&mut self, name: &str) -> HalResult<SignalInfo> {
        let (r, _) = self.signal(name)?;
        let pins = self
            .signal_pins(r.id)
            .into_iter()
            .map(|pr| {
                (
                    self.header(pr).name().to_string(),
                    self.get::<PinObject>(pr).dir(),
                )
            })
            .collect();
        let s = self.get::<SignalObject>(r);
        Ok(SignalInfo {
            name: name.to_string(),
            id: r.id,
            hal_type: s.hal_type(),
            value: s.value.load(s.hal_type(), s.hdr.flags()),
            readers: s.readers(),
            writers: s.writers(),
            bidirs: s.bidirs(),
            pins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp::CompKind;
    use crate::store::HalStore;

    fn setup() -> HalStore {
        let s = HalStore::in_memory(128 * 1024, 128).unwrap();
        {
            let mut g = s.lock().unwrap();
            let a = g.comp_new("a", CompKind::Realtime, 0).unwrap();
            let b = g.comp_new("b", CompKind::Realtime, 0).unwrap();
            g.pin_new(a, "a.out", HalType::Float, PinDir::Out, 0).unwrap();
            g.pin_new(a, "a.io", HalType::Float, PinDir::Io, 0).unwrap();
            g.pin_new(a, "a.in", HalType::Float, PinDir::In, 0).unwrap();
            g.pin_new(a, "a.bit", HalType::Bit, PinDir::In, 0).unwrap();
            g.pin_new(b, "b.out", HalType::Float, PinDir::Out, 0).unwrap();
            g.pin_new(b, "b.io", HalType::Float, PinDir::Io, 0).unwrap();
            g.pin_new(b, "b.in", HalType::Float, PinDir::In, 0).unwrap();
        }
        s
    }

    #[test]
    fn net_creates_signal_from_first_pin() {
        let s = setup();
        let mut g = s.lock().unwrap();
        let out = g.net("s1", &["a.out", "b.in"]).unwrap();
        assert!(out.created);
        assert_eq!(out.linked, vec!["a.out", "b.in"]);
        let info = g.signal_info("s1").unwrap();
        assert_eq!(info.hal_type, HalType::Float);
        assert_eq!((info.writers, info.readers, info.bidirs), (1, 1, 0));
        assert_eq!(
            info.pins,
            vec![("a.out".to_string(), PinDir::Out), ("b.in".to_string(), PinDir::In)]
        );
    }

    #[test]
    fn second_writer_rejected_without_side_effects() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s1", &["a.out"]).unwrap();
        let err = g.net("s1", &["b.in", "b.out"]).unwrap_err();
        assert!(matches!(err, HalError::CardinalityViolation { .. }));
        let info = g.signal_info("s1").unwrap();
        assert_eq!((info.writers, info.readers), (1, 0));
        assert_eq!(g.pin_info("b.in").unwrap().signal, None);
    }

    #[test]
    fn writer_and_bidir_never_share_a_signal() {
        let s = setup();
        let mut g = s.lock().unwrap();
        assert!(matches!(
            g.net("s", &["a.out", "b.io"]),
            Err(HalError::CardinalityViolation { .. })
        ));
        assert!(g.find(ObjectType::Signal, "s").is_none());
        g.net("s", &["a.io"]).unwrap();
        assert!(matches!(
            g.link("b.io", "s"),
            Err(HalError::CardinalityViolation { .. })
        ));
        assert!(matches!(
            g.link("b.out", "s"),
            Err(HalError::CardinalityViolation { .. })
        ));
    }

    #[test]
    fn type_mismatch_and_existing_links() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("f", &["a.in"]).unwrap();
        assert!(matches!(
            g.net("f", &["a.bit"]),
            Err(HalError::TypeMismatch { .. })
        ));
        assert!(matches!(
            g.net("other", &["b.out", "a.in"]),
            Err(HalError::AlreadyLinked { .. })
        ));
        assert!(g.find(ObjectType::Signal, "other").is_none());
        assert!(matches!(g.net("a.in", &["a.in"]), Err(HalError::InvalidArgument(_))));
        let none: [&str; 0] = [];
        assert!(g.net("x", &none).is_err());
    }

    #[test]
    fn net_skips_duplicates_and_pins_already_on_signal() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s", &["a.out", "a.in"]).unwrap();
        let out = g.net("s", &["a.in", "b.in", "b.in"]).unwrap();
        assert!(!out.created);
        assert_eq!(out.linked, vec!["b.in"]);
        assert_eq!(out.skipped, vec!["a.in", "b.in"]);
        assert_eq!(g.signal_info("s").unwrap().readers, 2);
    }

    #[test]
    fn link_moves_pin_between_signals() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s1", &["a.in"]).unwrap();
        g.signal_new("s2", HalType::Float).unwrap();
        g.link("a.in", "s2").unwrap();
        assert_eq!(g.signal_info("s1").unwrap().readers, 0);
        assert_eq!(g.signal_info("s2").unwrap().readers, 1);
        g.link("a.in", "s2").unwrap();
        assert_eq!(g.signal_info("s2").unwrap().readers, 1);
    }

    #[test]
    fn unlink_is_idempotent_and_keeps_value() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s", &["a.in"]).unwrap();
        g.sets("s", "1.5").unwrap();
        g.unlink("a.in").unwrap();
        g.unlink("a.in").unwrap();
        assert_eq!(g.pin_get("a.in").unwrap(), HalValue::Float(1.5));
        assert_eq!(g.signal_info("s").unwrap().readers, 0);
    }

    #[test]
    fn sets_refused_with_writer() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s", &["a.out"]).unwrap();
        assert!(matches!(g.sets("s", "1"), Err(HalError::ReadOnly { .. })));
        g.unlink("a.out").unwrap();
        g.sets("s", "2").unwrap();
        assert!(g.signal_set("s", HalValue::Bit(true)).is_err());
    }

    #[test]
    fn output_pin_value_carried_onto_signal() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s", &["b.io"]).unwrap();
        g.sets("s", "4").unwrap();
        g.unlink("b.io").unwrap();
        g.net("t", &["b.io", "b.in"]).unwrap();
        assert_eq!(g.signal_get("t").unwrap(), HalValue::Float(4.0));
        assert_eq!(g.pin_get("b.in").unwrap(), HalValue::Float(4.0));
    }

    #[test]
    fn delete_unlinks_pins() {
        let s = setup();
        let mut g = s.lock().unwrap();
        g.net("s", &["a.out", "b.in"]).unwrap();
        g.signal_delete("s").unwrap();
        assert_eq!(g.pin_info("a.out").unwrap().signal, None);
        g.net("s", &["b.out", "a.in"]).unwrap();
        g.net("t", &["a.io"]).unwrap();
        assert_eq!(g.signal_delete_all().unwrap(), 2);
        assert_eq!(g.count(&ObjectFilter::of_type(ObjectType::Signal)), 0);
    }
}
