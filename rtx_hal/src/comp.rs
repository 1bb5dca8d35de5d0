//! Components and instances.
//!
//! A component owns pins, params and functions (directly or through its
//! instances). Realtime and user components go straight to `Ready`; remote
//! components move through `Unbound` and `Bound` as their peer comes and goes.

use crate::error::{HalError, HalResult};
use crate::object::{HalObject, ObjectFilter, ObjectHeader, ObjectRef, ObjectType, Visit};
use crate::store::{HalGuard, HalStore};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Kind of component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CompKind {
    /// Module loaded into the module host.
    Realtime = 1,
    /// Userspace process.
    User = 2,
    /// Remote peer bound over the network.
    Remote = 3,
}

impl CompKind {
    /// Keyword used in commands.
    pub fn as_str(self) -> &'static str {
        match self {
            CompKind::Realtime => "rt",
            CompKind::User => "user",
            CompKind::Remote => "remote",
        }
    }

    /// Parse a keyword.
    pub fn parse(s: &str) -> HalResult<Self> {
        match s {
            "rt" | "realtime" => Ok(CompKind::Realtime),
            "user" => Ok(CompKind::User),
            "remote" => Ok(CompKind::Remote),
            _ => Err(HalError::InvalidArgument(format!("unknown component kind '{s}'"))),
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CompKind::Realtime,
            2 => CompKind::User,
            _ => CompKind::Remote,
        }
    }
}

/// Component life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CompState {
    /// Pins and params are still being created.
    Initializing = 1,
    /// Remote component without a peer.
    Unbound = 2,
    /// Remote component with a peer.
    Bound = 3,
    /// Fully set up.
    Ready = 4,
}

impl CompState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            CompState::Initializing => "initializing",
            CompState::Unbound => "unbound",
            CompState::Bound => "bound",
            CompState::Ready => "ready",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            2 => CompState::Unbound,
            3 => CompState::Bound,
            4 => CompState::Ready,
            _ => CompState::Initializing,
        }
    }
}

impl fmt::Display for CompState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component record in the arena.
#[repr(C)]
#[derive(Debug)]
pub struct CompObject {
    pub(crate) hdr: ObjectHeader,
    kind: u8,
    state: AtomicU8,
    _pad: u16,
    pid: AtomicU32,
    args_off: AtomicU32,
    args_len: AtomicU32,
    last_update: AtomicU64,
    last_bound: AtomicU64,
    last_unbound: AtomicU64,
}

// SAFETY: repr(C), header first, mutable fields atomic.
unsafe impl HalObject for CompObject {
    const TYPE: ObjectType = ObjectType::Component;
}

impl CompObject {
    /// Kind.
    pub fn kind(&self) -> CompKind {
        CompKind::from_u8(self.kind)
    }

    /// Current state.
    pub fn state(&self) -> CompState {
        CompState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Owning process.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    fn transition(&self, to: CompState) {
        self.state.store(to as u8, Ordering::Release);
        let stamp = match to {
            CompState::Bound => &self.last_bound,
            CompState::Unbound => &self.last_unbound,
            _ => &self.last_update,
        };
        stamp.store(now_us(), Ordering::Relaxed);
    }
}

/// Instance record: a named copy of an instantiable component.
#[repr(C)]
#[derive(Debug)]
pub struct InstObject {
    pub(crate) hdr: ObjectHeader,
    args_off: u32,
    args_len: u32,
}

// SAFETY: repr(C), header first, no mutable fields.
unsafe impl HalObject for InstObject {
    const TYPE: ObjectType = ObjectType::Instance;
}

/// Snapshot of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompInfo {
    /// Name.
    pub name: String,
    /// Object id.
    pub id: u32,
    /// Kind.
    pub kind: CompKind,
    /// State.
    pub state: CompState,
    /// Owning process.
    pub pid: u32,
    /// Load arguments.
    pub args: String,
}

/// Snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstInfo {
    /// Instance name.
    pub name: String,
    /// Owning component name.
    pub comp: String,
    /// Creation arguments.
    pub args: String,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl HalGuard<'_> {
    /// Create a component in state `Initializing`.
    pub fn comp_new(&mut self, name: &str, kind: CompKind, pid: u32) -> HalResult<ObjectRef> {
        let r = self.insert(name, 0, |hdr| CompObject {
            hdr,
            kind: kind as u8,
            state: AtomicU8::new(CompState::Initializing as u8),
            _pad: 0,
            pid: AtomicU32::new(pid),
            args_off: AtomicU32::new(0),
            args_len: AtomicU32::new(0),
            last_update: AtomicU64::new(now_us()),
            last_bound: AtomicU64::new(0),
            last_unbound: AtomicU64::new(0),
        })?;
        debug!("Component '{}' created ({})", name, kind.as_str());
        Ok(r)
    }

    fn comp(&self, name: &str) -> HalResult<(ObjectRef, &CompObject)> {
        let r = self.lookup(ObjectType::Component, name)?;
        Ok((r, self.get::<CompObject>(r)))
    }

    /// Store the load arguments of a component, replacing earlier ones.
    pub fn comp_set_args(&mut self, name: &str, args: &str) -> HalResult<()> {
        let (r, _) = self.comp(name)?;
        let off = if args.is_empty() {
            0
        } else {
            self.alloc_bytes(args.as_bytes())?
        };
        let c = self.get::<CompObject>(r);
        let old = c.args_off.swap(off, Ordering::Relaxed);
        c.args_len.store(args.len() as u32, Ordering::Relaxed);
        if old != 0 {
            self.free_bytes(old)?;
        }
        Ok(())
    }

    /// Load arguments of a component.
    pub fn comp_args(&self, name: &str) -> HalResult<String> {
        let (_, c) = self.comp(name)?;
        Ok(self.args_text(
            c.args_off.load(Ordering::Relaxed),
            c.args_len.load(Ordering::Relaxed),
        ))
    }

    fn args_text(&self, off: u32, len: u32) -> String {
        if off == 0 {
            return String::new();
        }
        String::from_utf8_lossy(&self.read_bytes(off, len as usize)).into_owned()
    }

    /// Finish setup: remote components become `Unbound`, others `Ready`.
    pub fn comp_ready(&mut self, name: &str) -> HalResult<CompState> {
        let (_, c) = self.comp(name)?;
        if c.state() != CompState::Initializing {
            return Err(HalError::InvalidState {
                name: name.to_string(),
                state: c.state().as_str(),
                expected: CompState::Initializing.as_str(),
            });
        }
        let to = match c.kind() {
            CompKind::Remote => CompState::Unbound,
            _ => CompState::Ready,
        };
        c.transition(to);
        info!("Component '{}' is {}", name, to);
        Ok(to)
    }

    /// Mark a remote component as bound to its peer.
    pub fn comp_bind(&mut self, name: &str) -> HalResult<()> {
        self.comp_move(name, CompState::Unbound, CompState::Bound)
    }

    /// Mark a remote component as released by its peer.
    pub fn comp_unbind(&mut self, name: &str) -> HalResult<()> {
        self.comp_move(name, CompState::Bound, CompState::Unbound)
    }

    fn comp_move(&mut self, name: &str, from: CompState, to: CompState) -> HalResult<()> {
        let (_, c) = self.comp(name)?;
        if c.kind() != CompKind::Remote {
            return Err(HalError::InvalidArgument(format!(
                "component '{name}' is not remote"
            )));
        }
        if c.state() != from {
            return Err(HalError::InvalidState {
                name: name.to_string(),
                state: c.state().as_str(),
                expected: from.as_str(),
            });
        }
        c.transition(to);
        debug!("Component '{}' {} -> {}", name, from, to);
        Ok(())
    }

    /// State of a component.
    pub fn comp_state(&self, name: &str) -> HalResult<CompState> {
        Ok(self.comp(name)?.1.state())
    }

    /// Snapshot of a component.
    pub fn comp_info(&self, name: &str) -> HalResult<CompInfo> {
        let (r, c) = self.comp(name)?;
        Ok(CompInfo {
            name: name.to_string(),
            id: r.id,
            kind: c.kind(),
            state: c.state(),
            pid: c.pid(),
            args: self.comp_args(name)?,
        })
    }

    /// Delete a component with its instances, pins, params and functions.
    ///
    /// Functions are removed from their threads first. Signals stay.
    pub fn comp_delete(&mut self, name: &str) -> HalResult<()> {
        let (r, c) = self.comp(name)?;
        let args_off = c.args_off.load(Ordering::Relaxed);
        let insts = self.names(&ObjectFilter::of_type(ObjectType::Instance).owned_by(r.id));
        for inst in insts {
            self.inst_delete(&inst)?;
        }
        self.delete_owned(r.id)?;
        if args_off != 0 {
            self.free_bytes(args_off)?;
        }
        self.remove(r)?;
        info!("Component '{}' deleted", name);
        Ok(())
    }

    // Functions, pins and params owned by `owner_id`.
    fn delete_owned(&mut self, owner_id: u32) -> HalResult<()> {
        let mut first_err = None;
        self.foreach(&ObjectFilter::default().owned_by(owner_id), |g, r| {
            let name = g.header(r).name().to_string();
            let res = match r.object_type {
                ObjectType::Function => g.funct_delete(&name),
                ObjectType::Pin => g.pin_delete(&name),
                ObjectType::Param => g.param_delete(&name),
                _ => Ok(()),
            };
            if let Err(e) = res {
                first_err = Some(e);
                return Visit::Stop;
            }
            Visit::Continue
        });
        first_err.map_or(Ok(()), Err)
    }

    /// Components in creation order.
    pub fn comp_names(&mut self) -> Vec<String> {
        self.names(&ObjectFilter::of_type(ObjectType::Component))
    }

    /// Create instance `name` of component `comp`.
    pub fn inst_new(&mut self, comp: &str, name: &str, args: &str) -> HalResult<ObjectRef> {
        let (c, _) = self.comp(comp)?;
        let args_off = if args.is_empty() {
            0
        } else {
            self.alloc_bytes(args.as_bytes())?
        };
        let res = self.insert(name, c.id, |hdr| InstObject {
            hdr,
            args_off,
            args_len: args.len() as u32,
        });
        if res.is_err() && args_off != 0 {
            self.free_bytes(args_off)?;
        }
        let r = res?;
        debug!("Instance '{}' of '{}' created", name, comp);
        Ok(r)
    }

    /// Delete an instance with its pins, params and functions.
    pub fn inst_delete(&mut self, name: &str) -> HalResult<()> {
        let r = self.lookup(ObjectType::Instance, name)?;
        let args_off = self.get::<InstObject>(r).args_off;
        self.delete_owned(r.id)?;
        if args_off != 0 {
            self.free_bytes(args_off)?;
        }
        self.remove(r)?;
        debug!("Instance '{}' deleted", name);
        Ok(())
    }

    /// Snapshot of an instance.
    pub fn inst_info(&self, name: &str) -> HalResult<InstInfo> {
        let r = self.lookup(ObjectType::Instance, name)?;
        let i = self.get::<InstObject>(r);
        Ok(InstInfo {
            name: name.to_string(),
            comp: self.name_of(self.header(r).owner_id()),
            args: self.args_text(i.args_off, i.args_len),
        })
    }

    /// Name of the component owning `owner_id`, resolving instances.
    pub fn owning_comp(&self, owner_id: u32) -> Option<String> {
        let r = self.find_by_id(owner_id)?;
        match r.object_type {
            ObjectType::Component => Some(self.header(r).name().to_string()),
            ObjectType::Instance => self.owning_comp(self.header(r).owner_id()),
            _ => None,
        }
    }
}

impl HalStore {
    /// Poll until component `name` reaches `state`.
    ///
    /// Returns `Ok(false)` when `stop` is raised first. The component must
    /// exist on every poll.
    pub fn wait_for_state(
        &self,
        name: &str,
        state: CompState,
        stop: &AtomicBool,
        interval: Duration,
    ) -> HalResult<bool> {
        loop {
            if self.lock()?.comp_state(name)? == state {
                return Ok(true);
            }
            if stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
            std::thread::sleep(interval);
        }
    }

    /// Poll until component `name` disappears. `Ok(false)` when stopped.
    pub fn wait_for_exit(&self, name: &str, stop: &AtomicBool, interval: Duration) -> HalResult<bool> {
        loop {
            if self.lock()?.find(ObjectType::Component, name).is_none() {
                return Ok(true);
            }
            if stop.load(Ordering::Relaxed) {
                return Ok(false);
            }
            std::thread::sleep(interval);
        }
    }
}
