//! Process-local code behind exported functions.
//!
//! The object store only records a function's handle. The closure itself
//! lives here, keyed by that handle. Realtime threads look bodies up through
//! [`FunctionTable::try_view`], which never blocks; loading and unloading take
//! the write side and therefore wait for running cycles to finish.

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rtx_common::flavor::TaskCycle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Code of an exported function, run once per thread cycle.
pub type FunctBody = Box<dyn FnMut(&TaskCycle) + Send>;

struct FunctSlot {
    name: String,
    module: String,
    owner: String,
    body: Mutex<FunctBody>,
    busy: AtomicU64,
}

/// Handle-keyed table of function bodies.
pub struct FunctionTable {
    next_handle: AtomicU64,
    slots: RwLock<HashMap<u64, FunctSlot>>,
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable {
    /// Empty table. Handles start at 1.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Register `body` and return its handle.
    pub fn insert(&self, module: &str, owner: &str, name: &str, body: FunctBody) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.slots.write().insert(
            handle,
            FunctSlot {
                name: name.to_string(),
                module: module.to_string(),
                owner: owner.to_string(),
                body: Mutex::new(body),
                busy: AtomicU64::new(0),
            },
        );
        handle
    }

    /// Drop one body. Returns whether it existed.
    pub fn remove(&self, handle: u64) -> bool {
        self.slots.write().remove(&handle).is_some()
    }

    /// Drop every body exported by `owner` (a component or instance name).
    pub fn remove_owner(&self, owner: &str) -> usize {
        self.remove_where(|s| s.owner == owner)
    }

    /// Drop every body of `module`, instances included.
    pub fn remove_module(&self, module: &str) -> usize {
        self.remove_where(|s| s.module == module)
    }

    fn remove_where(&self, pred: impl Fn(&FunctSlot) -> bool) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, s| !pred(s));
        before - slots.len()
    }

    /// Number of registered bodies.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// No bodies registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Function names exported by `module`, sorted.
    pub fn names_of(&self, module: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .read()
            .values()
            .filter(|s| s.module == module)
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Cycles skipped for `handle` because its body was already running.
    pub fn busy_count(&self, handle: u64) -> u64 {
        self.slots
            .read()
            .get(&handle)
            .map_or(0, |s| s.busy.load(Ordering::Relaxed))
    }

    /// Run one body outside a realtime thread.
    pub fn call(&self, handle: u64, cycle: &TaskCycle) -> bool {
        invoke(&self.slots.read(), handle, cycle)
    }

    /// Read view for a realtime cycle, `None` while a writer holds the table.
    pub fn try_view(&self) -> Option<FunctionsView<'_>> {
        self.slots.try_read().map(FunctionsView)
    }
}

/// Read access to the bodies for the duration of one cycle.
pub struct FunctionsView<'a>(RwLockReadGuard<'a, HashMap<u64, FunctSlot>>);

impl FunctionsView<'_> {
    /// Run the body of `handle`. `false` if it is gone or already running.
    pub fn call(&self, handle: u64, cycle: &TaskCycle) -> bool {
        invoke(&self.0, handle, cycle)
    }
}

fn invoke(slots: &HashMap<u64, FunctSlot>, handle: u64, cycle: &TaskCycle) -> bool {
    let Some(slot) = slots.get(&handle) else {
        return false;
    };
    match slot.body.try_lock() {
        Some(mut body) => {
            (&mut **body)(cycle);
            true
        }
        None => {
            slot.busy.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn cycle() -> TaskCycle {
        TaskCycle {
            index: 0,
            start_ns: 0,
            period_ns: 1_000_000,
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> FunctBody {
        let c = Arc::clone(counter);
        Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn handles_are_unique_and_callable() {
        let table = FunctionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = table.insert("scale", "scale.0", "scale.0.update", counting(&hits));
        let b = table.insert("scale", "scale.1", "scale.1.update", counting(&hits));
        assert_ne!(a, b);
        assert!(table.call(a, &cycle()));
        let view = table.try_view().unwrap();
        assert!(view.call(b, &cycle()));
        assert!(!view.call(999, &cycle()));
        drop(view);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_by_owner_and_module() {
        let table = FunctionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.insert("scale", "scale.0", "scale.0.update", counting(&hits));
        table.insert("scale", "scale.1", "scale.1.update", counting(&hits));
        let logic = table.insert("logic", "logic", "logic.update", counting(&hits));
        assert_eq!(table.names_of("scale"), vec!["scale.0.update", "scale.1.update"]);
        assert_eq!(table.remove_owner("scale.0"), 1);
        assert_eq!(table.remove_module("scale"), 1);
        assert_eq!(table.len(), 1);
        assert!(table.remove(logic));
        assert!(!table.remove(logic));
        assert!(table.is_empty());
    }

    #[test]
    fn writer_blocks_realtime_view() {
        let table = FunctionTable::new();
        let guard = table.slots.write();
        assert!(table.try_view().is_none());
        drop(guard);
        assert!(table.try_view().is_some());
    }
}
