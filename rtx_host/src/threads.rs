//! Scheduled threads.
//!
//! Every object store thread created through the host gets a flavor task.
//! While threads are started, each cycle runs the thread's functions in list
//! order. The function list is copied into a fixed-capacity snapshot under
//! the realtime try-lock; when the lock is busy the previous snapshot is used.

use crate::error::HostResult;
use crate::functions::FunctionTable;
use heapless::Vec as FixedVec;
use rtx_common::consts::MAX_FUNCTS_PER_THREAD;
use rtx_common::flavor::{Flavor, Task, TaskCycle, TaskSpec};
use rtx_hal::{FunctEntry, HalStore, ObjectRef, ObjectType};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

struct ManagedThread {
    name: String,
    period_ns: u64,
    task: Task,
}

/// Flavor tasks backing the object store threads of this process.
pub struct ThreadManager {
    flavor: Flavor,
    store: Arc<HalStore>,
    functions: Arc<FunctionTable>,
    threads: Vec<ManagedThread>,
}

impl ThreadManager {
    /// Manager creating tasks on `flavor`.
    pub fn new(flavor: Flavor, store: Arc<HalStore>, functions: Arc<FunctionTable>) -> Self {
        Self {
            flavor,
            store,
            functions,
            threads: Vec::new(),
        }
    }

    /// Start the task of existing store thread `name`.
    ///
    /// Without an explicit priority, shorter periods get higher priorities.
    /// POSIX threads always run on the POSIX flavor.
    pub fn spawn(&mut self, name: &str) -> HostResult<()> {
        let (thread, spec) = {
            let g = self.store.lock()?;
            (g.lookup(ObjectType::Thread, name)?, g.thread_info(name)?.spec)
        };
        let flavor = if spec.posix { Flavor::Posix } else { self.flavor };
        let rank = self
            .threads
            .iter()
            .filter(|t| t.period_ns < spec.period_ns)
            .count() as u32;
        let priority = spec
            .priority
            .unwrap_or_else(|| flavor.prio_below_highest(rank));

        let mut task = flavor.task_new(TaskSpec {
            name: name.to_string(),
            period: Duration::from_nanos(spec.period_ns),
            priority,
            cpu: spec.cpu.map(|c| c as usize),
            uses_fp: spec.uses_fp,
        })?;
        let mut body = ThreadBody {
            store: Arc::clone(&self.store),
            functions: Arc::clone(&self.functions),
            flavor,
            thread,
            snapshot: FixedVec::new(),
            truncated: false,
        };
        task.start(move |cycle| body.run(cycle))?;
        info!(
            "Thread '{}' running on {} (period {} ns, priority {})",
            name, flavor, spec.period_ns, priority
        );
        self.threads.push(ManagedThread {
            name: name.to_string(),
            period_ns: spec.period_ns,
            task,
        });
        Ok(())
    }

    /// Stop and forget the task of `name`. `false` if there was none.
    pub fn stop(&mut self, name: &str) -> HostResult<bool> {
        let Some(pos) = self.threads.iter().position(|t| t.name == name) else {
            return Ok(false);
        };
        let mut thread = self.threads.remove(pos);
        thread.task.stop()?;
        Ok(true)
    }

    /// Stop every task, newest first.
    pub fn stop_all(&mut self) {
        while let Some(mut thread) = self.threads.pop() {
            if let Err(e) = thread.task.stop() {
                warn!("Thread '{}': {}", thread.name, e);
            }
        }
    }

    /// Names of the managed threads in creation order.
    pub fn names(&self) -> Vec<String> {
        self.threads.iter().map(|t| t.name.clone()).collect()
    }

    /// Cycles run by the task of `name`, paused ones excluded.
    pub fn cycles(&self, name: &str) -> Option<u64> {
        self.threads
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.task.stats().cycles.load(Ordering::Relaxed))
    }

    /// Number of managed threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// No threads are managed.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct ThreadBody {
    store: Arc<HalStore>,
    functions: Arc<FunctionTable>,
    flavor: Flavor,
    thread: ObjectRef,
    snapshot: FixedVec<FunctEntry, MAX_FUNCTS_PER_THREAD>,
    /// The list outgrew the snapshot once already.
    truncated: bool,
}

/// Append `entry`, counting it in `skipped` when the snapshot is full.
fn take_entry<const N: usize>(
    snapshot: &mut FixedVec<FunctEntry, N>,
    entry: FunctEntry,
    skipped: &mut usize,
) {
    if snapshot.push(entry).is_err() {
        *skipped += 1;
    }
}

impl ThreadBody {
    fn run(&mut self, cycle: &TaskCycle) {
        if !self.store.threads_running() {
            return;
        }
        if let Ok(g) = self.store.try_lock_rt() {
            self.snapshot.clear();
            let mut skipped = 0;
            if g.find_by_id(self.thread.id).is_some() {
                let snapshot = &mut self.snapshot;
                g.thread_entries(self.thread, |e| take_entry(snapshot, e, &mut skipped));
            }
            if skipped > 0 && !self.truncated {
                warn!(
                    "Thread {} lists more than {} functions, {} not run",
                    self.thread.id, MAX_FUNCTS_PER_THREAD, skipped
                );
                self.truncated = true;
            }
        }
        // Unloading holds the write side until our view is gone.
        let Some(view) = self.functions.try_view() else {
            return;
        };

        let start = self.flavor.get_time();
        for entry in &self.snapshot {
            let t0 = self.flavor.get_time();
            if view.call(entry.handle, cycle) {
                let ns = (self.flavor.get_time() - t0).max(0) as u64;
                self.store.record_funct_time(entry.off, ns);
            }
        }
        let ns = (self.flavor.get_time() - start).max(0) as u64;
        self.store.record_thread_cycle(self.thread.off, ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_hal::{CompKind, ThreadSpec};
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<HalStore>, Arc<FunctionTable>) {
        (
            Arc::new(HalStore::in_memory(128 * 1024, 64).unwrap()),
            Arc::new(FunctionTable::new()),
        )
    }

    fn export(
        store: &HalStore,
        functions: &FunctionTable,
        name: &str,
        log: &Arc<parking_lot::Mutex<Vec<String>>>,
    ) {
        let mut g = store.lock().unwrap();
        let owner = g
            .find(ObjectType::Component, "demo")
            .map_or_else(|| g.comp_new("demo", CompKind::Realtime, 1), Ok)
            .unwrap();
        let seen = Arc::clone(log);
        let tag = name.to_string();
        let handle = functions.insert(
            "demo",
            "demo",
            name,
            Box::new(move |_| seen.lock().push(tag.clone())),
        );
        g.funct_new(owner, name, false, false, handle).unwrap();
    }

    #[test]
    fn full_snapshot_counts_skipped_entries() {
        let mut snapshot: FixedVec<FunctEntry, 2> = FixedVec::new();
        let mut skipped = 0;
        for id in 1..=5 {
            let entry = FunctEntry { id, off: id * 8, handle: id as u64 };
            take_entry(&mut snapshot, entry, &mut skipped);
        }
        assert_eq!(skipped, 3);
        let ids: Vec<u32> = snapshot.iter().map(|e| e.id).collect();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn functions_run_in_list_order_once_started() {
        let (store, functions) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        export(&store, &functions, "f1", &log);
        export(&store, &functions, "f2", &log);
        {
            let mut g = store.lock().unwrap();
            g.thread_new("t1", &ThreadSpec::new(1_000_000)).unwrap();
            g.add_funct("f2", "t1", -1).unwrap();
            g.add_funct("f1", "t1", 1).unwrap();
        }

        let mut mgr = ThreadManager::new(Flavor::Posix, Arc::clone(&store), functions);
        mgr.spawn("t1").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(log.lock().is_empty(), "threads are not started yet");

        store.set_threads_running(true);
        std::thread::sleep(Duration::from_millis(30));
        store.set_threads_running(false);
        std::thread::sleep(Duration::from_millis(5));
        assert!(mgr.stop("t1").unwrap());
        assert!(!mgr.stop("t1").unwrap());

        let log = log.lock();
        assert!(log.len() >= 2);
        assert_eq!(&log[..2], &["f1".to_string(), "f2".to_string()]);
        let info = store.lock().unwrap().thread_info("t1").unwrap();
        assert!(info.cycles > 0);
    }

    #[test]
    fn removed_bodies_are_skipped() {
        let (store, functions) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let mut g = store.lock().unwrap();
            let owner = g.comp_new("demo", CompKind::Realtime, 1).unwrap();
            let seen = Arc::clone(&hits);
            let handle = functions.insert(
                "demo",
                "demo",
                "demo.tick",
                Box::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            );
            g.funct_new(owner, "demo.tick", false, false, handle).unwrap();
            g.thread_new("fast", &ThreadSpec::new(1_000_000)).unwrap();
            g.add_funct("demo.tick", "fast", -1).unwrap();
        }
        store.set_threads_running(true);
        let mut mgr = ThreadManager::new(Flavor::Posix, Arc::clone(&store), Arc::clone(&functions));
        mgr.spawn("fast").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(functions.remove_module("demo"), 1);
        let after_removal = hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        mgr.stop_all();
        assert!(after_removal > 0);
        assert_eq!(hits.load(Ordering::SeqCst), after_removal);
        assert!(mgr.is_empty());
    }

    #[test]
    fn unknown_thread_is_an_error() {
        let (store, functions) = setup();
        let mut mgr = ThreadManager::new(Flavor::Posix, store, functions);
        assert!(mgr.spawn("nope").is_err());
        assert_eq!(mgr.len(), 0);
    }
}
