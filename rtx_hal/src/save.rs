//! Export of the object graph as commands.
//!
//! Replaying the output of [`save`] on an empty session rebuilds the same
//! components, pins, signals, links, rings, groups and thread lists.

use crate::command::Command;
use crate::comp::{CompKind, CompState};
use crate::error::HalResult;
use crate::object::{ObjectFilter, ObjectRef, ObjectType};
use crate::pin::{ParamObject, PinObject};
use crate::ring::RingObject;
use crate::store::HalGuard;
use crate::value::{HalValue, ParamDir, PinDir};

/// Part of the graph to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveScope {
    /// Everything, in replay order.
    #[default]
    All,
    /// Modules, instances and non-realtime components with their pins.
    Comp,
    /// Unlinked signals and signal values.
    Sig,
    /// Nets.
    Net,
    /// Writable params and unlinked input pins.
    Param,
    /// Store rings.
    Ring,
    /// Groups and members.
    Group,
    /// Threads and their function lists.
    Thread,
}

impl SaveScope {
    /// Keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            SaveScope::All => "all",
            SaveScope::Comp => "comp",
            SaveScope::Sig => "sig",
            SaveScope::Net => "net",
            SaveScope::Param => "param",
            SaveScope::Ring => "ring",
            SaveScope::Group => "group",
            SaveScope::Thread => "thread",
        }
    }

    /// Parse a keyword.
    pub fn parse(s: &str) -> Option<Self> {
        [
            SaveScope::All,
            SaveScope::Comp,
            SaveScope::Sig,
            SaveScope::Net,
            SaveScope::Param,
            SaveScope::Ring,
            SaveScope::Group,
            SaveScope::Thread,
        ]
        .into_iter()
        .find(|sc| sc.as_str() == s)
    }

    fn includes(self, part: SaveScope) -> bool {
        self == SaveScope::All || self == part
    }
}

fn key_values(args: &str) -> Vec<(String, String)> {
    args.split_whitespace()
        .filter_map(|w| w.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn is_zero(v: &HalValue) -> bool {
    v.to_bits() == 0
}

/// Commands rebuilding the `scope` part of the graph, in replay order.
pub fn save(g: &mut HalGuard<'_>, scope: SaveScope) -> HalResult<Vec<Command>> {
    let mut out = Vec::new();
    if scope.includes(SaveScope::Comp) {
        save_comps(g, &mut out)?;
    }
    let signals = g.collect(&ObjectFilter::of_type(ObjectType::Signal));
    if scope.includes(SaveScope::Sig) {
        for &s in &signals {
            if g.signal_pins(s.id).is_empty() {
                let name = g.header(s).name().to_string();
                let info = g.signal_info(&name)?;
                out.push(Command::NewSig {
                    name: info.name,
                    hal_type: info.hal_type,
                });
            }
        }
    }
    if scope.includes(SaveScope::Net) {
        for &s in &signals {
            let name = g.header(s).name().to_string();
            let info = g.signal_info(&name)?;
            if info.pins.is_empty() {
                continue;
            }
            let mut pins = info.pins;
            pins.sort_by_key(|(_, dir)| match dir {
                PinDir::Out => 0,
                PinDir::Io => 1,
                PinDir::In => 2,
            });
            out.push(Command::Net {
                signal: name,
                pins: pins.into_iter().map(|(p, _)| p).collect(),
            });
        }
    }
    if scope.includes(SaveScope::Sig) {
        for &s in &signals {
            let name = g.header(s).name().to_string();
            let info = g.signal_info(&name)?;
            if info.writers == 0 && !is_zero(&info.value) {
                out.push(Command::SetS {
                    name: info.name,
                    value: info.value.to_string(),
                });
            }
        }
    }
    if scope.includes(SaveScope::Param) {
        save_values(g, &mut out)?;
    }
    if scope.includes(SaveScope::Ring) {
        for r in g.collect(&ObjectFilter::of_type(ObjectType::Ring)) {
            out.push(Command::NewRing {
                name: g.header(r).name().to_string(),
                config: g.get::<RingObject>(r).config(),
            });
        }
    }
    if scope.includes(SaveScope::Group) {
        for r in g.collect(&ObjectFilter::of_type(ObjectType::Group)) {
            let name = g.header(r).name().to_string();
            let info = g.group_info(&name)?;
            out.push(Command::NewGroup {
                name: info.name.clone(),
                arg1: info.arg1,
                flags: info.flags,
            });
            for m in info.members {
                out.push(Command::NewMember {
                    group: info.name.clone(),
                    signal: m.signal,
                    arg1: m.arg1,
                    eps: m.eps_index,
                });
            }
        }
    }
    if scope.includes(SaveScope::Thread) {
        let threads = g.names(&ObjectFilter::of_type(ObjectType::Thread));
        let infos = threads
            .iter()
            .map(|t| g.thread_info(t))
            .collect::<HalResult<Vec<_>>>()?;
        for info in &infos {
            out.push(Command::NewThread {
                name: info.name.clone(),
                spec: info.spec.clone(),
            });
        }
        for info in infos {
            for funct in info.functs {
                out.push(Command::AddF {
                    funct,
                    thread: info.name.clone(),
                    position: -1,
                });
            }
        }
    }
    Ok(out)
}

fn save_comps(g: &mut HalGuard<'_>, out: &mut Vec<Command>) -> HalResult<()> {
    for name in g.comp_names() {
        let info = g.comp_info(&name)?;
        let c = g.lookup(ObjectType::Component, &name)?;
        match info.kind {
            CompKind::Realtime => {
                out.push(Command::LoadRt {
                    module: name.clone(),
                    args: key_values(&info.args),
                });
                for inst in g.names(&ObjectFilter::of_type(ObjectType::Instance).owned_by(c.id)) {
                    let inst_info = g.inst_info(&inst)?;
                    out.push(Command::NewInst {
                        module: name.clone(),
                        inst,
                        args: key_values(&inst_info.args),
                    });
                }
            }
            kind => {
                out.push(Command::NewComp {
                    name: name.clone(),
                    kind,
                });
                for p in g.collect(&ObjectFilter::of_type(ObjectType::Pin).owned_by(c.id)) {
                    let pin = g.get::<PinObject>(p);
                    out.push(Command::NewPin {
                        comp: name.clone(),
                        pin: g.header(p).name().to_string(),
                        hal_type: pin.hal_type(),
                        dir: pin.dir(),
                        eps: pin.eps_index(),
                    });
                }
                if info.state != CompState::Initializing {
                    out.push(Command::Ready { comp: name });
                }
            }
        }
    }
    Ok(())
}

fn save_values(g: &mut HalGuard<'_>, out: &mut Vec<Command>) -> HalResult<()> {
    let refs: Vec<ObjectRef> = g
        .collect(&ObjectFilter::of_type(ObjectType::Param))
        .into_iter()
        .chain(g.collect(&ObjectFilter::of_type(ObjectType::Pin)))
        .collect();
    for r in refs {
        let name = g.header(r).name().to_string();
        let value = match r.object_type {
            ObjectType::Param if g.get::<ParamObject>(r).dir() == ParamDir::Rw => {
                g.param_get(&name)?
            }
            ObjectType::Pin => {
                let p = g.get::<PinObject>(r);
                if p.dir() == PinDir::Out || p.signal_id() != 0 {
                    continue;
                }
                let v = g.pin_get(&name)?;
                if is_zero(&v) {
                    continue;
                }
                v
            }
            _ => continue,
        };
        out.push(Command::SetP {
            name,
            value: value.to_string(),
        });
    }
    Ok(())
}
