//! Compiled change-detection sets.
//!
//! A [`CompiledSet`] resolves the pins of a component, or the signals of a
//! group, once. Afterwards [`CompiledSet::changes`] and
//! [`CompiledSet::report`] compare live values against the last reported
//! ones without touching the store mutex. Floats compare through the
//! epsilon table.

use crate::error::{HalError, HalResult};
use crate::group::GroupFlags;
use crate::object::{ObjectFilter, ObjectFlags, ObjectType};
use crate::pin::PinObject;
use crate::signal::SignalObject;
use crate::store::HalStore;
use crate::value::{HalType, HalValue};
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy)]
enum Source {
    // Pin offset; the value cell is looked up on each read so relinking is seen.
    Pin(u32),
    // Signal value cell offset.
    Signal(u32),
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    hal_type: HalType,
    eps_index: u8,
    flags: ObjectFlags,
    source: Source,
    last: Option<HalValue>,
}

/// Snapshot set over pins or signals.
pub struct CompiledSet {
    store: Arc<HalStore>,
    owner: String,
    report_on_change: bool,
    entries: Vec<Entry>,
}

impl CompiledSet {
    /// Watch every pin of component `comp` and of its instances.
    pub fn compile_component(store: &Arc<HalStore>, comp: &str) -> HalResult<Self> {
        let mut g = store.lock()?;
        let c = g.lookup(ObjectType::Component, comp)?;
        let mut owners = vec![c.id];
        owners.extend(
            g.collect(&ObjectFilter::of_type(ObjectType::Instance).owned_by(c.id))
                .into_iter()
                .map(|r| r.id),
        );
        let mut entries = Vec::new();
        for owner in owners {
            for r in g.collect(&ObjectFilter::of_type(ObjectType::Pin).owned_by(owner)) {
                let p = g.get::<PinObject>(r);
                entries.push(Entry {
                    name: g.header(r).name().to_string(),
                    hal_type: p.hal_type(),
                    eps_index: p.eps_index(),
                    flags: g.header(r).flags(),
                    source: Source::Pin(r.off),
                    last: None,
                });
            }
        }
        Ok(Self {
            store: Arc::clone(store),
            owner: comp.to_string(),
            report_on_change: true,
            entries,
        })
    }

    /// Watch the member signals of `group`.
    ///
    /// Members keep their signals alive, so the set stays valid while the
    /// group exists.
    pub fn compile_group(store: &Arc<HalStore>, group: &str) -> HalResult<Self> {
        let mut g = store.lock()?;
        let gr = g.lookup(ObjectType::Group, group)?;
        let members = g.group_member_refs(gr);
        if members.is_empty() {
            return Err(HalError::InvalidArgument(format!(
                "group '{group}' has no members"
            )));
        }
        let entries = members
            .into_iter()
            .map(|(m, s)| Entry {
                name: g.header(s).name().to_string(),
                hal_type: g.get::<SignalObject>(s).hal_type(),
                eps_index: g.member_eps(m),
                flags: g.header(s).flags(),
                source: Source::Signal(SignalObject::value_off(s.off)),
                last: None,
            })
            .collect();
        Ok(Self {
            store: Arc::clone(store),
            owner: group.to_string(),
            report_on_change: g.group_flags(gr).contains(GroupFlags::REPORT_ON_CHANGE),
            entries,
        })
    }

    /// Component or group name.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of watched values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn current(&self, e: &Entry) -> HalValue {
        let off = match e.source {
            Source::Pin(pin) => self
                .store
                .object::<PinObject>(pin)
                .value_off
                .load(Ordering::Acquire),
            Source::Signal(cell) => cell,
        };
        self.store.cell(off).load(e.hal_type, e.flags)
    }

    fn changed(&self, e: &Entry) -> bool {
        e.last.is_none_or(|last| {
            self.current(e)
                .differs(&last, self.store.epsilon(e.eps_index))
        })
    }

    /// Number of values that differ from the last report.
    pub fn changes(&self) -> usize {
        self.entries.iter().filter(|e| self.changed(e)).count()
    }

    /// Call `f` for each changed value (every value with `report_all`, or
    /// for groups without change-only reporting) and remember what was
    /// reported. Returns the number of calls.
    pub fn report(&mut self, report_all: bool, mut f: impl FnMut(&str, HalValue)) -> usize {
        let all = report_all || !self.report_on_change;
        let mut reported = 0;
        for i in 0..self.entries.len() {
            let e = &self.entries[i];
            if !all && !self.changed(e) {
                continue;
            }
            let value = self.current(e);
            f(&e.name, value);
            self.entries[i].last = Some(value);
            reported += 1;
        }
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp::CompKind;
    use crate::value::PinDir;

    fn setup() -> Arc<HalStore> {
        let s = Arc::new(HalStore::in_memory(128 * 1024, 64).unwrap());
        {
            let mut g = s.lock().unwrap();
            let c = g.comp_new("panel", CompKind::Remote, 0).unwrap();
            g.pin_new(c, "panel.speed", HalType::Float, PinDir::In, 1).unwrap();
            g.pin_new(c, "panel.on", HalType::Bit, PinDir::Out, 0).unwrap();
            g.comp_ready("panel").unwrap();
        }
        s.set_epsilon(1, 0.1).unwrap();
        s
    }

    #[test]
    fn first_report_covers_everything_then_only_changes() {
        let s = setup();
        let mut set = CompiledSet::compile_component(&s, "panel").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.changes(), 2);
        assert_eq!(set.report(false, |_, _| {}), 2);
        assert_eq!(set.changes(), 0);

        s.lock().unwrap().setp("panel.speed", "0.05").unwrap();
        assert_eq!(set.changes(), 0);
        s.lock().unwrap().setp("panel.speed", "0.5").unwrap();
        let mut seen = Vec::new();
        set.report(false, |n, v| seen.push((n.to_string(), v)));
        assert_eq!(seen, vec![("panel.speed".to_string(), HalValue::Float(0.5))]);
        assert_eq!(set.report(true, |_, _| {}), 2);
    }

    #[test]
    fn pin_sets_see_relinking() {
        let s = setup();
        let set = {
            let mut set = CompiledSet::compile_component(&s, "panel").unwrap();
            set.report(false, |_, _| {});
            set
        };
        {
            let mut g = s.lock().unwrap();
            g.signal_new("speed", HalType::Float).unwrap();
            g.sets("speed", "2").unwrap();
            g.link("panel.speed", "speed").unwrap();
        }
        assert_eq!(set.changes(), 1);
    }

    #[test]
    fn group_sets_follow_flags() {
        let s = setup();
        {
            let mut g = s.lock().unwrap();
            g.signal_new("a", HalType::S32).unwrap();
            g.signal_new("b", HalType::S32).unwrap();
            g.group_new("all", 0, 0).unwrap();
            g.member_new("all", "a", 0, 0).unwrap();
            g.member_new("all", "b", 0, 0).unwrap();
            g.group_new("empty", 0, 1).unwrap();
        }
        assert!(CompiledSet::compile_group(&s, "empty").is_err());
        let mut set = CompiledSet::compile_group(&s, "all").unwrap();
        set.report(false, |_, _| {});
        s.lock().unwrap().sets("a", "3").unwrap();
        assert_eq!(set.changes(), 1);
        assert_eq!(set.report(false, |_, _| {}), 2);
    }
}
