//! Functions and threads.
//!
//! A thread holds an ordered list of function ids. Realtime executors take
//! a snapshot with [`HalGuard::thread_entries`] under the realtime lock
//! budget and run it without further locking.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectFilter, ObjectHeader, ObjectRef, ObjectType};
use crate::store::{HalGuard, HalStore};
use bitflags::bitflags;
use rtx_common::consts::MAX_FUNCTS_PER_THREAD;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

bitflags! {
    /// Scheduling attributes of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Functions may use floating point.
        const USES_FP = 1 << 0;
        /// Plain POSIX thread even under a realtime flavor.
        const POSIX = 1 << 1;
    }
}

/// Function record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct FunctObject {
    pub(crate) hdr: ObjectHeader,
    uses_fp: u8,
    reentrant: u8,
    _pad: u16,
    users: AtomicU32,
    handle: u64,
    runtime: AtomicU64,
    maxtime: AtomicU64,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for FunctObject {
    const TYPE: ObjectType = ObjectType::Function;
}

impl FunctObject {
    /// Threads running this function.
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Relaxed)
    }

    /// Key of the code in the owning process.
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// Thread record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadObject {
    pub(crate) hdr: ObjectHeader,
    period_ns: u64,
    priority: i32,
    cpu: i32,
    flags: u32,
    funct_count: AtomicU32,
    functs: [AtomicU32; MAX_FUNCTS_PER_THREAD],
    runtime: AtomicU64,
    maxtime: AtomicU64,
    cycles: AtomicU64,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for ThreadObject {
    const TYPE: ObjectType = ObjectType::Thread;
}

impl ThreadObject {
    /// Period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Scheduling attributes.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags)
    }

    fn ids(&self) -> Vec<u32> {
        let n = self.funct_count.load(Ordering::Acquire) as usize;
        self.functs[..n.min(MAX_FUNCTS_PER_THREAD)]
            .iter()
            .map(|f| f.load(Ordering::Acquire))
            .collect()
    }

    // Readers take a snapshot under the lock; writers hold it too.
    fn write_ids(&self, ids: &[u32]) {
        for (slot, id) in self.functs.iter().zip(ids) {
            slot.store(*id, Ordering::Relaxed);
        }
        self.funct_count
            .store(ids.len() as u32, Ordering::Release);
    }
}

/// Parameters of a new thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSpec {
    /// Period in nanoseconds.
    pub period_ns: u64,
    /// Priority in the flavor's own scale; `None` picks by period rank.
    pub priority: Option<i32>,
    /// CPU to pin to.
    pub cpu: Option<u32>,
    /// Floating point allowed.
    pub uses_fp: bool,
    /// Plain POSIX thread.
    pub posix: bool,
}

impl ThreadSpec {
    /// FP thread with `period_ns` and default placement.
    pub fn new(period_ns: u64) -> Self {
        Self {
            period_ns,
            priority: None,
            cpu: None,
            uses_fp: true,
            posix: false,
        }
    }
}

/// Snapshot of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    /// Thread name.
    pub name: String,
    /// Object id.
    pub id: u32,
    /// Creation parameters.
    pub spec: ThreadSpec,
    /// Function names in execution order.
    pub functs: Vec<String>,
    /// Last cycle time in ns.
    pub runtime: u64,
    /// Longest cycle time in ns.
    pub maxtime: u64,
    /// Completed cycles.
    pub cycles: u64,
}

/// Snapshot of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctInfo {
    /// Function name.
    pub name: String,
    /// Owning component or instance.
    pub owner: String,
    /// Threads running it.
    pub users: u32,
    /// Uses floating point.
    pub uses_fp: bool,
    /// May run on several threads.
    pub reentrant: bool,
    /// Last run time in ns.
    pub runtime: u64,
    /// Longest run time in ns.
    pub maxtime: u64,
}

/// One scheduled function, as seen by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctEntry {
    /// Object id.
    pub id: u32,
    /// Store offset, for timing updates.
    pub off: u32,
    /// Code key in the owning process.
    pub handle: u64,
}

// 1-based insertion index for `position` in a list of `count`: `p > 0` is
// the slot itself, `p < 0` counts from the end with `-1` appending.
fn insert_index(position: i32, count: usize) -> Option<usize> {
    let n = count as i64;
    let p = position as i64;
    let idx = match p {
        0 => return None,
        p if p > 0 => p - 1,
        p => n + 1 + p,
    };
    (0..=n).contains(&idx).then_some(idx as usize)
}

impl HalGuard<'_> {
    /// Export a function owned by a component or instance.
    pub fn funct_new(
        &mut self,
        owner: ObjectRef,
        name: &str,
        uses_fp: bool,
        reentrant: bool,
        handle: u64,
    ) -> HalResult<ObjectRef> {
        if !matches!(
            owner.object_type,
            ObjectType::Component | ObjectType::Instance
        ) {
            return Err(HalError::InvalidArgument(format!(
                "a {} cannot own functions",
                owner.object_type
            )));
        }
        let r = self.insert(name, owner.id, |hdr| FunctObject {
            hdr,
            uses_fp: uses_fp as u8,
            reentrant: reentrant as u8,
            _pad: 0,
            users: AtomicU32::new(0),
            handle,
            runtime: AtomicU64::new(0),
            maxtime: AtomicU64::new(0),
        })?;
        debug!("Function '{}' exported", name);
        Ok(r)
    }

    /// Remove a function from every thread and delete it.
    pub fn funct_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Function, name)?;
        for t in self.collect(&ObjectFilter::of_type(ObjectType::Thread)) {
            let thread = self.get::<ThreadObject>(t);
            let ids = thread.ids();
            if ids.contains(&r.id) {
                let kept: Vec<u32> = ids.into_iter().filter(|&id| id != r.id).collect();
                thread.write_ids(&kept);
            }
        }
        self.remove(r)
    }

    /// Snapshot of a function.
    pub fn funct_info(&self, name: &str) -> HalResult<FunctInfo> {
        let r = self.lookup(ObjectType::Function, name)?;
        let f = self.get::<FunctObject>(r);
        Ok(FunctInfo {
            name: name.to_string(),
            owner: self.name_of(self.header(r).owner_id()),
            users: f.users(),
            uses_fp: f.uses_fp != 0,
            reentrant: f.reentrant != 0,
            runtime: f.runtime.load(Ordering::Relaxed),
            maxtime: f.maxtime.load(Ordering::Relaxed),
        })
    }

    /// Create a thread with no functions.
    pub fn thread_new(&mut self, name: &str, spec: &ThreadSpec) -> HalResult<ObjectRef> {
        if spec.period_ns == 0 {
            return Err(HalError::InvalidArgument(format!(
                "thread '{name}' needs a non-zero period"
            )));
        }
        let mut flags = ThreadFlags::empty();
        flags.set(ThreadFlags::USES_FP, spec.uses_fp);
        flags.set(ThreadFlags::POSIX, spec.posix);
        let r = self.insert(name, 0, |hdr| ThreadObject {
            hdr,
            period_ns: spec.period_ns,
            priority: spec.priority.unwrap_or(-1),
            cpu: spec.cpu.map_or(-1, |c| c as i32),
            flags: flags.bits(),
            funct_count: AtomicU32::new(0),
            functs: std::array::from_fn(|_| AtomicU32::new(0)),
            runtime: AtomicU64::new(0),
            maxtime: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        })?;
        info!("Thread '{}' created, period {} ns", name, spec.period_ns);
        Ok(r)
    }

    /// Remove all functions from a thread and delete it.
    pub fn thread_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Thread, name)?;
        for id in self.get::<ThreadObject>(r).ids() {
            if let Some(f) = self.find_by_id(id) {
                self.get::<FunctObject>(f)
                    .users
                    .fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.remove(r)?;
        info!("Thread '{}' deleted", name);
        Ok(())
    }

    /// Add `funct` to `thread` at `position` (`-1` appends, `1` is first).
    pub fn add_funct(&mut self, funct: &str, thread: &str, position: i32) -> HalResult<()> {
        let fr = self.lookup(ObjectType::Function, funct)?;
        let tr = self.lookup(ObjectType::Thread, thread)?;
        let f = self.get::<FunctObject>(fr);
        let t = self.get::<ThreadObject>(tr);
        let mut ids = t.ids();
        if ids.contains(&fr.id) {
            return Err(HalError::AlreadyExists {
                kind: "function on thread",
                name: format!("{funct} on {thread}"),
            });
        }
        let bad_position = || HalError::BadPosition {
            thread: thread.to_string(),
            position,
            count: ids.len(),
        };
        let idx = insert_index(position, ids.len()).ok_or_else(bad_position)?;
        if f.reentrant == 0 && f.users() > 0 {
            return Err(HalError::NotReentrant {
                funct: funct.to_string(),
            });
        }
        if f.uses_fp != 0 && !t.flags().contains(ThreadFlags::USES_FP) {
            return Err(HalError::NeedsFp {
                funct: funct.to_string(),
                thread: thread.to_string(),
            });
        }
        if ids.len() >= MAX_FUNCTS_PER_THREAD {
            return Err(HalError::AllocationExhausted {
                what: "thread function list",
            });
        }
        ids.insert(idx, fr.id);
        t.write_ids(&ids);
        f.users.fetch_add(1, Ordering::Relaxed);
        debug!("Added '{}' to '{}' at {}", funct, thread, idx + 1);
        Ok(())
    }

    /// Remove `funct` from `thread`.
    pub fn del_funct(&mut self, funct: &str, thread: &str) -> HalResult<()> {
        let fr = self.lookup(ObjectType::Function, funct)?;
        let tr = self.lookup(ObjectType::Thread, thread)?;
        let t = self.get::<ThreadObject>(tr);
        let mut ids = t.ids();
        let pos = ids
            .iter()
            .position(|&id| id == fr.id)
            .ok_or_else(|| HalError::not_found("function on thread", funct))?;
        ids.remove(pos);
        t.write_ids(&ids);
        self.get::<FunctObject>(fr)
            .users
            .fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Function names of `thread` in execution order.
    pub fn thread_functs(&self, thread: &str) -> HalResult<Vec<String>> {
        let tr = self.lookup(ObjectType::Thread, thread)?;
        Ok(self
            .get::<ThreadObject>(tr)
            .ids()
            .into_iter()
            .map(|id| self.name_of(id))
            .collect())
    }

    /// Visit the functions of `thread` in order without allocating.
    pub fn thread_entries(&self, thread: ObjectRef, mut f: impl FnMut(FunctEntry)) {
        let t = self.get::<ThreadObject>(thread);
        let n = (t.funct_count.load(Ordering::Acquire) as usize).min(MAX_FUNCTS_PER_THREAD);
        for slot in &t.functs[..n] {
            let id = slot.load(Ordering::Acquire);
            if let Some(r) = self.find_by_id(id) {
                f(FunctEntry {
                    id,
                    off: r.off,
                    handle: self.get::<FunctObject>(r).handle,
                });
            }
        }
    }

    /// Snapshot of a thread.
    pub fn thread_info(&self, name: &str) -> HalResult<ThreadInfo> {
        let r = self.lookup(ObjectType::Thread, name)?;
        let t = self.get::<ThreadObject>(r);
        Ok(ThreadInfo {
            name: name.to_string(),
            id: r.id,
            spec: ThreadSpec {
                period_ns: t.period_ns,
                priority: (t.priority >= 0).then_some(t.priority),
                cpu: (t.cpu >= 0).then_some(t.cpu as u32),
                uses_fp: t.flags().contains(ThreadFlags::USES_FP),
                posix: t.flags().contains(ThreadFlags::POSIX),
            },
            functs: self.thread_functs(name)?,
            runtime: t.runtime.load(Ordering::Relaxed),
            maxtime: t.maxtime.load(Ordering::Relaxed),
            cycles: t.cycles.load(Ordering::Relaxed),
        })
    }
}

impl HalStore {
    /// Record one run of the function at `off`. Lock-free.
    pub fn record_funct_time(&self, off: u32, ns: u64) {
        let f = self.object::<FunctObject>(off);
        f.runtime.store(ns, Ordering::Relaxed);
        f.maxtime.fetch_max(ns, Ordering::Relaxed);
    }

    /// Record one cycle of the thread at `off`. Lock-free.
    pub fn record_thread_cycle(&self, off: u32, ns: u64) {
        let t = self.object::<ThreadObject>(off);
        t.runtime.store(ns, Ordering::Relaxed);
        t.maxtime.fetch_max(ns, Ordering::Relaxed);
        t.cycles.fetch_add(1, Ordering::Relaxed);
    }
}
