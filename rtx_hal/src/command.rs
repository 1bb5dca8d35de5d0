//! Text commands over the object store.
//!
//! One command per line, `#` starts a comment. [`parse_line`] turns a line
//! into a [`Command`]; its `Display` form parses back to the same command,
//! which is what `save` relies on. A [`CommandTarget`] executes commands and
//! answers with a [`CommandResult`].

use crate::comp::CompKind;
use crate::error::{HalError, HalResult};
use crate::object::{ObjectFilter, ObjectType};
use crate::save::{SaveScope, save};
use crate::store::HalStore;
use crate::thread::ThreadSpec;
use crate::value::{HalType, PinDir};
use rtx_common::config::LogLevel;
use rtx_shared_memory::{MsgOrigin, RingConfig, RingMode, Session};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A parsed command.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `newcomp name [rt|user|remote]`
    NewComp { name: String, kind: CompKind },
    /// `newpin comp pin type dir [eps=N]`
    NewPin {
        comp: String,
        pin: String,
        hal_type: HalType,
        dir: PinDir,
        eps: u8,
    },
    /// `delpin pin`
    DelPin { pin: String },
    /// `ready comp`
    Ready { comp: String },
    /// `newsig name type`
    NewSig { name: String, hal_type: HalType },
    /// `delsig name|all`
    DelSig { name: Option<String> },
    /// `net signal pin...`; arrows between pins are ignored.
    Net { signal: String, pins: Vec<String> },
    /// `linkps pin signal`
    LinkPs { pin: String, signal: String },
    /// `unlinkp pin`
    UnlinkP { pin: String },
    /// `setp name value`
    SetP { name: String, value: String },
    /// `sets signal value`
    SetS { name: String, value: String },
    /// `newring name size [record|stream|multi] [multi] [scratch=N]`
    NewRing { name: String, config: RingConfig },
    /// `delring name`
    DelRing { name: String },
    /// `newg name [arg1 [flags]]`
    NewGroup { name: String, arg1: i32, flags: u32 },
    /// `delg name`
    DelGroup { name: String },
    /// `newm group signal [arg1] [eps=N]`
    NewMember {
        group: String,
        signal: String,
        arg1: i32,
        eps: u8,
    },
    /// `delm group signal`
    DelMember { group: String, signal: String },
    /// `newthread name period [fp|nofp] [cpu=N] [prio=N] [posix]`
    NewThread { name: String, spec: ThreadSpec },
    /// `delthread name`
    DelThread { name: String },
    /// `addf funct thread [position]`
    AddF {
        funct: String,
        thread: String,
        position: i32,
    },
    /// `delf funct thread`
    DelF { funct: String, thread: String },
    /// `loadrt module [key=value...]`
    LoadRt {
        module: String,
        args: Vec<(String, String)>,
    },
    /// `unloadrt module|all`
    UnloadRt { module: String },
    /// `newinst module instance [key=value...]`
    NewInst {
        module: String,
        inst: String,
        args: Vec<(String, String)>,
    },
    /// `delinst instance`
    DelInst { inst: String },
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `log [rt|user] [level]`
    Log {
        origin: Option<MsgOrigin>,
        level: Option<LogLevel>,
    },
    /// `list type [pattern]`
    List {
        object_type: ObjectType,
        pattern: Option<String>,
    },
    /// `save [all|comp|sig|net|param|ring|group|thread]`
    Save { scope: SaveScope },
}

impl Command {
    /// First word of the command line.
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::NewComp { .. } => "newcomp",
            Command::NewPin { .. } => "newpin",
            Command::DelPin { .. } => "delpin",
            Command::Ready { .. } => "ready",
            Command::NewSig { .. } => "newsig",
            Command::DelSig { .. } => "delsig",
            Command::Net { .. } => "net",
            Command::LinkPs { .. } => "linkps",
            Command::UnlinkP { .. } => "unlinkp",
            Command::SetP { .. } => "setp",
            Command::SetS { .. } => "sets",
            Command::NewRing { .. } => "newring",
            Command::DelRing { .. } => "delring",
            Command::NewGroup { .. } => "newg",
            Command::DelGroup { .. } => "delg",
            Command::NewMember { .. } => "newm",
            Command::DelMember { .. } => "delm",
            Command::NewThread { .. } => "newthread",
            Command::DelThread { .. } => "delthread",
            Command::AddF { .. } => "addf",
            Command::DelF { .. } => "delf",
            Command::LoadRt { .. } => "loadrt",
            Command::UnloadRt { .. } => "unloadrt",
            Command::NewInst { .. } => "newinst",
            Command::DelInst { .. } => "delinst",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Log { .. } => "log",
            Command::List { .. } => "list",
            Command::Save { .. } => "save",
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[(String, String)]) -> fmt::Result {
    for (k, v) in args {
        write!(f, " {k}={v}")?;
    }
    Ok(())
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = self.keyword();
        match self {
            Command::NewComp { name, kind } => write!(f, "{kw} {name} {}", kind.as_str()),
            Command::NewPin {
                comp,
                pin,
                hal_type,
                dir,
                eps,
            } => {
                write!(f, "{kw} {comp} {pin} {hal_type} {dir}")?;
                if *eps != 0 {
                    write!(f, " eps={eps}")?;
                }
                Ok(())
            }
            Command::DelPin { pin: name }
            | Command::Ready { comp: name }
            | Command::UnlinkP { pin: name }
            | Command::DelRing { name }
            | Command::DelGroup { name }
            | Command::DelThread { name }
            | Command::UnloadRt { module: name }
            | Command::DelInst { inst: name } => write!(f, "{kw} {name}"),
            Command::NewSig { name, hal_type } => write!(f, "{kw} {name} {hal_type}"),
            Command::DelSig { name } => write!(f, "{kw} {}", name.as_deref().unwrap_or("all")),
            Command::Net { signal, pins } => write!(f, "{kw} {signal} {}", pins.join(" ")),
            Command::LinkPs { pin, signal } => write!(f, "{kw} {pin} {signal}"),
            Command::SetP { name, value } | Command::SetS { name, value } => {
                write!(f, "{kw} {name} {value}")
            }
            Command::NewRing { name, config } => {
                write!(f, "{kw} {name} {} {}", config.capacity, config.mode.as_str())?;
                if config.writers == rtx_shared_memory::WriterMode::Multi {
                    f.write_str(" multi")?;
                }
                if config.scratch > 0 {
                    write!(f, " scratch={}", config.scratch)?;
                }
                Ok(())
            }
            Command::NewGroup { name, arg1, flags } => write!(f, "{kw} {name} {arg1} {flags}"),
            Command::NewMember {
                group,
                signal,
                arg1,
                eps,
            } => {
                write!(f, "{kw} {group} {signal} {arg1}")?;
                if *eps != 0 {
                    write!(f, " eps={eps}")?;
                }
                Ok(())
            }
            Command::DelMember { group, signal } => write!(f, "{kw} {group} {signal}"),
            Command::NewThread { name, spec } => {
                write!(f, "{kw} {name} {}", spec.period_ns)?;
                f.write_str(if spec.uses_fp { " fp" } else { " nofp" })?;
                if let Some(cpu) = spec.cpu {
                    write!(f, " cpu={cpu}")?;
                }
                if let Some(prio) = spec.priority {
                    write!(f, " prio={prio}")?;
                }
                if spec.posix {
                    f.write_str(" posix")?;
                }
                Ok(())
            }
            Command::AddF {
                funct,
                thread,
                position,
            } => write!(f, "{kw} {funct} {thread} {position}"),
            Command::DelF { funct, thread } => write!(f, "{kw} {funct} {thread}"),
            Command::LoadRt { module, args } => {
                write!(f, "{kw} {module}")?;
                write_args(f, args)
            }
            Command::NewInst { module, inst, args } => {
                write!(f, "{kw} {module} {inst}")?;
                write_args(f, args)
            }
            Command::Start | Command::Stop => f.write_str(kw),
            Command::Log { origin, level } => {
                f.write_str(kw)?;
                if let Some(o) = origin {
                    write!(f, " {}", o.as_str())?;
                }
                if let Some(l) = level {
                    write!(f, " {l}")?;
                }
                Ok(())
            }
            Command::List {
                object_type,
                pattern,
            } => {
                write!(f, "{kw} {object_type}")?;
                if let Some(p) = pattern {
                    write!(f, " {p}")?;
                }
                Ok(())
            }
            Command::Save { scope } => write!(f, "{kw} {}", scope.as_str()),
        }
    }
}

struct Tokens<'a> {
    words: std::iter::Peekable<std::str::SplitWhitespace<'a>>,
    keyword: &'a str,
}

impl<'a> Tokens<'a> {
    fn err(&self, reason: impl Into<String>) -> HalError {
        HalError::Parse {
            line: 0,
            reason: format!("{}: {}", self.keyword, reason.into()),
        }
    }

    fn next(&mut self, what: &str) -> HalResult<&'a str> {
        self.words
            .next()
            .ok_or_else(|| self.err(format!("missing {what}")))
    }

    fn opt(&mut self) -> Option<&'a str> {
        self.words.next()
    }

    fn number<T: std::str::FromStr>(&self, word: &str, what: &str) -> HalResult<T> {
        word.parse()
            .map_err(|_| self.err(format!("bad {what} '{word}'")))
    }

    fn rest(&mut self) -> Vec<&'a str> {
        self.words.by_ref().collect()
    }

    fn key_values(&mut self) -> HalResult<Vec<(String, String)>> {
        self.rest()
            .into_iter()
            .map(|w| {
                w.split_once('=')
                    .filter(|(k, _)| !k.is_empty())
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| self.err(format!("expected key=value, got '{w}'")))
            })
            .collect()
    }

    fn done(&mut self) -> HalResult<()> {
        match self.words.next() {
            None => Ok(()),
            Some(w) => Err(self.err(format!("unexpected '{w}'"))),
        }
    }
}

fn kind_or_parse<T>(res: HalResult<T>, t: &Tokens<'_>) -> HalResult<T> {
    res.map_err(|e| t.err(e.to_string()))
}

/// Parse one line. Blank lines and comments give `None`.
pub fn parse_line(line: &str) -> HalResult<Option<Command>> {
    let text = line.split('#').next().unwrap_or("").trim();
    let mut words = text.split_whitespace().peekable();
    let Some(keyword) = words.next() else {
        return Ok(None);
    };
    let mut t = Tokens { words, keyword };
    let s = |w: &str| w.to_string();

    let cmd = match keyword {
        "newcomp" => {
            let name = s(t.next("component name")?);
            let kind = match t.opt() {
                Some(k) => kind_or_parse(CompKind::parse(k), &t)?,
                None => CompKind::Remote,
            };
            Command::NewComp { name, kind }
        }
        "newpin" => {
            let comp = s(t.next("component")?);
            let pin = s(t.next("pin name")?);
            let hal_type = kind_or_parse(HalType::parse(t.next("type")?), &t)?;
            let dir = kind_or_parse(PinDir::parse(t.next("direction")?), &t)?;
            let mut eps = 0;
            for w in t.rest() {
                match w.strip_prefix("eps=") {
                    Some(v) => eps = t.number(v, "epsilon index")?,
                    None => return Err(t.err(format!("unexpected '{w}'"))),
                }
            }
            Command::NewPin {
                comp,
                pin,
                hal_type,
                dir,
                eps,
            }
        }
        "delpin" => Command::DelPin {
            pin: s(t.next("pin")?),
        },
        "ready" => Command::Ready {
            comp: s(t.next("component")?),
        },
        "newsig" => Command::NewSig {
            name: s(t.next("signal name")?),
            hal_type: kind_or_parse(HalType::parse(t.next("type")?), &t)?,
        },
        "delsig" => {
            let name = t.next("signal name or 'all'")?;
            Command::DelSig {
                name: (name != "all").then(|| s(name)),
            }
        }
        "net" => {
            let signal = s(t.next("signal")?);
            let pins: Vec<String> = t
                .rest()
                .into_iter()
                .filter(|w| !matches!(*w, "=>" | "<=" | "<=>"))
                .map(s)
                .collect();
            if pins.is_empty() {
                return Err(t.err("no pins"));
            }
            Command::Net { signal, pins }
        }
        "linkps" | "linkpn" => Command::LinkPs {
            pin: s(t.next("pin")?),
            signal: s(t.next("signal")?),
        },
        "linksp" => {
            let signal = s(t.next("signal")?);
            Command::LinkPs {
                pin: s(t.next("pin")?),
                signal,
            }
        }
        "unlinkp" => Command::UnlinkP {
            pin: s(t.next("pin")?),
        },
        "setp" => Command::SetP {
            name: s(t.next("pin or param")?),
            value: s(t.next("value")?),
        },
        "sets" => Command::SetS {
            name: s(t.next("signal")?),
            value: s(t.next("value")?),
        },
        "newring" => {
            let name = s(t.next("ring name")?);
            let word = t.next("size")?;
            let size: usize = t.number(word, "size")?;
            let mut config = RingConfig::record(size);
            for w in t.rest() {
                if w == "multi" {
                    config = config.multi_writer();
                } else if let Some(v) = w.strip_prefix("scratch=") {
                    config = config.with_scratch(t.number(v, "scratch size")?);
                } else if let Some(mode) = RingMode::parse(w) {
                    config.mode = mode;
                } else {
                    return Err(t.err(format!("unexpected '{w}'")));
                }
            }
            Command::NewRing { name, config }
        }
        "delring" => Command::DelRing {
            name: s(t.next("ring")?),
        },
        "newg" => {
            let name = s(t.next("group name")?);
            let arg1 = t.opt().map(|w| t.number(w, "arg1")).transpose()?;
            let flags = t.opt().map(|w| t.number(w, "flags")).transpose()?;
            Command::NewGroup {
                name,
                arg1: arg1.unwrap_or(0),
                flags: flags.unwrap_or(0),
            }
        }
        "delg" => Command::DelGroup {
            name: s(t.next("group")?),
        },
        "newm" => {
            let group = s(t.next("group")?);
            let signal = s(t.next("signal")?);
            let (mut arg1, mut eps) = (0, 0);
            for w in t.rest() {
                match w.strip_prefix("eps=") {
                    Some(v) => eps = t.number(v, "epsilon index")?,
                    None => arg1 = t.number(w, "arg1")?,
                }
            }
            Command::NewMember {
                group,
                signal,
                arg1,
                eps,
            }
        }
        "delm" => Command::DelMember {
            group: s(t.next("group")?),
            signal: s(t.next("signal")?),
        },
        "newthread" => {
            let name = s(t.next("thread name")?);
            let word = t.next("period")?;
            let mut spec = ThreadSpec::new(t.number(word, "period")?);
            for w in t.rest() {
                match w {
                    "fp" => spec.uses_fp = true,
                    "nofp" => spec.uses_fp = false,
                    "posix" => spec.posix = true,
                    _ => {
                        if let Some(v) = w.strip_prefix("cpu=") {
                            spec.cpu = Some(t.number(v, "cpu")?);
                        } else if let Some(v) = w.strip_prefix("prio=") {
                            spec.priority = Some(t.number(v, "priority")?);
                        } else {
                            return Err(t.err(format!("unexpected '{w}'")));
                        }
                    }
                }
            }
            Command::NewThread { name, spec }
        }
        "delthread" => Command::DelThread {
            name: s(t.next("thread")?),
        },
        "addf" => {
            let funct = s(t.next("function")?);
            let thread = s(t.next("thread")?);
            let position = match t.opt() {
                Some(w) => t.number(w, "position")?,
                None => -1,
            };
            Command::AddF {
                funct,
                thread,
                position,
            }
        }
        "delf" => Command::DelF {
            funct: s(t.next("function")?),
            thread: s(t.next("thread")?),
        },
        "loadrt" => Command::LoadRt {
            module: s(t.next("module")?),
            args: t.key_values()?,
        },
        "unloadrt" => Command::UnloadRt {
            module: s(t.next("module or 'all'")?),
        },
        "newinst" => Command::NewInst {
            module: s(t.next("module")?),
            inst: s(t.next("instance name")?),
            args: t.key_values()?,
        },
        "delinst" => Command::DelInst {
            inst: s(t.next("instance")?),
        },
        "start" => Command::Start,
        "stop" => Command::Stop,
        "log" => {
            let mut origin = None;
            let mut level = None;
            for w in t.rest() {
                match w {
                    "rt" => origin = Some(MsgOrigin::Rt),
                    "user" => origin = Some(MsgOrigin::User),
                    _ => {
                        level = Some(
                            LogLevel::parse(w).ok_or_else(|| t.err(format!("bad level '{w}'")))?,
                        )
                    }
                }
            }
            Command::Log { origin, level }
        }
        "list" | "show" => {
            let word = t.next("object type")?;
            let object_type =
                ObjectType::parse(word).ok_or_else(|| t.err(format!("unknown type '{word}'")))?;
            Command::List {
                object_type,
                pattern: t.opt().map(s),
            }
        }
        "save" => {
            let scope = match t.opt() {
                Some(w) => SaveScope::parse(w).ok_or_else(|| t.err(format!("bad scope '{w}'")))?,
                None => SaveScope::All,
            };
            Command::Save { scope }
        }
        other => {
            return Err(HalError::Parse {
                line: 0,
                reason: format!("unknown command '{other}'"),
            });
        }
    };
    t.done()?;
    Ok(Some(cmd))
}

/// Reply to a command: `0` or a negative errno-style code, plus notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Result code.
    pub code: i32,
    /// Human readable output.
    pub notes: Vec<String>,
}

impl CommandResult {
    /// Success with `notes`.
    pub fn ok(notes: Vec<String>) -> Self {
        Self { code: 0, notes }
    }

    /// Failure carrying the error text.
    pub fn from_error(err: &HalError) -> Self {
        Self {
            code: err.code(),
            notes: vec![err.to_string()],
        }
    }

    /// Whether the command succeeded.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl From<HalResult<Vec<String>>> for CommandResult {
    fn from(res: HalResult<Vec<String>>) -> Self {
        match res {
            Ok(notes) => Self::ok(notes),
            Err(e) => Self::from_error(&e),
        }
    }
}

/// Something that executes commands.
pub trait CommandTarget {
    /// Run one command.
    fn execute(&mut self, cmd: &Command) -> CommandResult;

    /// Parse and run one line. Blank lines succeed with no notes.
    fn execute_line(&mut self, line: &str) -> CommandResult {
        match parse_line(line) {
            Ok(Some(cmd)) => self.execute(&cmd),
            Ok(None) => CommandResult::default(),
            Err(e) => CommandResult::from_error(&e),
        }
    }
}

/// Run a script, stopping at the first failing line.
///
/// Returns the number of commands executed.
pub fn run_script<T: CommandTarget + ?Sized>(target: &mut T, text: &str) -> HalResult<usize> {
    let mut executed = 0;
    for (i, line) in text.lines().enumerate() {
        let cmd = match parse_line(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(HalError::Parse { reason, .. }) => {
                return Err(HalError::Parse {
                    line: i + 1,
                    reason,
                });
            }
            Err(e) => return Err(e),
        };
        let res = target.execute(&cmd);
        if !res.is_ok() {
            return Err(HalError::CommandFailed {
                line: i + 1,
                code: res.code,
                message: res.notes.join("; "),
            });
        }
        executed += 1;
    }
    Ok(executed)
}

/// Executes object store commands. Module commands are left to the module host.
pub struct HalExecutor {
    store: Arc<HalStore>,
    session: Option<Arc<Session>>,
}

impl HalExecutor {
    /// Executor over `store`; `session` enables the `log` command.
    pub fn new(store: Arc<HalStore>, session: Option<Arc<Session>>) -> Self {
        Self { store, session }
    }

    /// The store commands act on.
    pub fn store(&self) -> &Arc<HalStore> {
        &self.store
    }

    fn run(&self, cmd: &Command) -> HalResult<Vec<String>> {
        let mut g = self.store.lock()?;
        let none = Ok(Vec::new());
        match cmd {
            Command::NewComp { name, kind } => {
                let pid = match kind {
                    CompKind::Remote => 0,
                    _ => std::process::id(),
                };
                g.comp_new(name, *kind, pid)?;
                none
            }
            Command::NewPin {
                comp,
                pin,
                hal_type,
                dir,
                eps,
            } => {
                let owner = g
                    .find(ObjectType::Component, comp)
                    .or_else(|| g.find(ObjectType::Instance, comp))
                    .ok_or_else(|| HalError::not_found("comp", comp))?;
                g.pin_new(owner, pin, *hal_type, *dir, *eps)?;
                none
            }
            Command::DelPin { pin } => g.pin_delete(pin).and(none),
            Command::Ready { comp } => Ok(vec![format!("{comp}: {}", g.comp_ready(comp)?)]),
            Command::NewSig { name, hal_type } => g.signal_new(name, *hal_type).and(none),
            Command::DelSig { name: Some(name) } => g.signal_delete(name).and(none),
            Command::DelSig { name: None } => {
                Ok(vec![format!("{} signal(s) deleted", g.signal_delete_all()?)])
            }
            Command::Net { signal, pins } => {
                let out = g.net(signal, pins.as_slice())?;
                let mut notes = Vec::new();
                if out.created {
                    notes.push(format!("signal '{signal}' created"));
                }
                notes.extend(out.skipped.iter().map(|p| format!("'{p}' skipped")));
                Ok(notes)
            }
            Command::LinkPs { pin, signal } => g.link(pin, signal).and(none),
            Command::UnlinkP { pin } => g.unlink(pin).and(none),
            Command::SetP { name, value } => g.setp(name, value).and(none),
            Command::SetS { name, value } => g.sets(name, value).and(none),
            Command::NewRing { name, config } => g.ring_new(name, config).and(none),
            Command::DelRing { name } => g.ring_delete(name).and(none),
            Command::NewGroup { name, arg1, flags } => g.group_new(name, *arg1, *flags).and(none),
            Command::DelGroup { name } => g.group_delete(name).and(none),
            Command::NewMember {
                group,
                signal,
                arg1,
                eps,
            } => g.member_new(group, signal, *arg1, *eps).and(none),
            Command::DelMember { group, signal } => g.member_delete(group, signal).and(none),
            Command::NewThread { name, spec } => g.thread_new(name, spec).and(none),
            Command::DelThread { name } => g.thread_delete(name).and(none),
            Command::AddF {
                funct,
                thread,
                position,
            } => g.add_funct(funct, thread, *position).and(none),
            Command::DelF { funct, thread } => g.del_funct(funct, thread).and(none),
            Command::Start => {
                self.store.set_threads_running(true);
                none
            }
            Command::Stop => {
                self.store.set_threads_running(false);
                none
            }
            Command::Log { origin, level } => {
                let session = self
                    .session
                    .as_ref()
                    .ok_or_else(|| HalError::Unsupported("log".into()))?;
                let origins = match origin {
                    Some(o) => vec![*o],
                    None => vec![MsgOrigin::Rt, MsgOrigin::User],
                };
                Ok(origins
                    .into_iter()
                    .map(|o| match level {
                        Some(l) => {
                            let old = session.set_msg_level(o, *l);
                            format!("{} level {} -> {}", o.as_str(), old, l)
                        }
                        None => format!("{} level {}", o.as_str(), session.msg_level(o)),
                    })
                    .collect())
            }
            Command::List {
                object_type,
                pattern,
            } => {
                let mut filter = ObjectFilter::of_type(*object_type);
                filter.pattern = pattern.clone();
                Ok(g.names(&filter))
            }
            Command::Save { scope } => Ok(save(&mut g, *scope)?
                .iter()
                .map(ToString::to_string)
                .collect()),
            Command::LoadRt { .. }
            | Command::UnloadRt { .. }
            | Command::NewInst { .. }
            | Command::DelInst { .. } => Err(HalError::Unsupported(cmd.keyword().to_string())),
        }
    }
}

impl CommandTarget for HalExecutor {
    fn execute(&mut self, cmd: &Command) -> CommandResult {
        let res = self.run(cmd);
        if let Err(e) = &res {
            debug!("'{}' failed: {}", cmd, e);
        }
        res.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn comments_and_blank_lines() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   # only a comment").unwrap(), None);
        assert_eq!(parse("start # go"), Command::Start);
    }

    #[test]
    fn net_ignores_arrows() {
        assert_eq!(
            parse("net speed a.out => b.in c.in"),
            Command::Net {
                signal: "speed".into(),
                pins: vec!["a.out".into(), "b.in".into(), "c.in".into()],
            }
        );
        assert!(parse_line("net speed").is_err());
    }

    #[test]
    fn options_and_defaults() {
        match parse("newthread servo 1000000 nofp cpu=2 prio=80 posix") {
            Command::NewThread { spec, .. } => {
                assert!(!spec.uses_fp && spec.posix);
                assert_eq!((spec.cpu, spec.priority), (Some(2), Some(80)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parse("addf f t"),
            Command::AddF {
                funct: "f".into(),
                thread: "t".into(),
                position: -1
            }
        );
        match parse("newring cmd 1024 multi stream scratch=64") {
            Command::NewRing { config, .. } => {
                assert_eq!(config.mode, RingMode::Stream);
                assert_eq!(config.scratch, 64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse("delsig all"), Command::DelSig { name: None });
        assert_eq!(
            parse("newcomp panel"),
            Command::NewComp {
                name: "panel".into(),
                kind: CompKind::Remote
            }
        );
    }

    #[test]
    fn display_parses_back() {
        for line in [
            "newpin panel panel.speed float in eps=2",
            "newthread servo 1000000 fp cpu=1",
            "newring log 4096 multipart multi scratch=128",
            "newm grp sig 3 eps=1",
            "loadrt logic count=2 names=a,b",
            "newinst scale scale.0 gain=2",
            "log rt debug",
            "list pin scale.*",
            "save net",
        ] {
            let cmd = parse(line);
            assert_eq!(parse(&cmd.to_string()), cmd, "{line}");
        }
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_line("bogus"), Err(HalError::Parse { .. })));
        assert!(parse_line("newsig x double").is_err());
        assert!(parse_line("newpin c p bit sideways").is_err());
        assert!(parse_line("loadrt m novalue").is_err());
        assert!(parse_line("setp a").is_err());
        assert!(parse_line("ready a b").is_err());
    }

    #[test]
    fn executor_reports_codes() {
        let store = Arc::new(HalStore::in_memory(128 * 1024, 64).unwrap());
        let mut ex = HalExecutor::new(store, None);
        assert!(ex.execute_line("newcomp c user").is_ok());
        assert!(ex.execute_line("newpin c c.out float out").is_ok());
        let res = ex.execute_line("net s c.out");
        assert_eq!(res.notes, vec!["signal 's' created"]);
        let res = ex.execute_line("newsig s float");
        assert_eq!(res.code, -libc::EEXIST);
        assert_eq!(ex.execute_line("loadrt m").code, -libc::ENOSYS);
        assert_eq!(ex.execute_line("log").code, -libc::ENOSYS);
        assert_eq!(ex.execute_line("list sig").notes, vec!["s"]);
        assert!(ex.execute_line("").is_ok());
    }

    #[test]
    fn script_stops_at_first_failure() {
        let store = Arc::new(HalStore::in_memory(128 * 1024, 64).unwrap());
        let mut ex = HalExecutor::new(Arc::clone(&store), None);
        let err = run_script(&mut ex, "newsig a bit\n\nnewsig a bit\nnewsig b bit\n").unwrap_err();
        assert!(matches!(err, HalError::CommandFailed { line: 3, .. }));
        assert!(store.lock().unwrap().find(ObjectType::Signal, "b").is_none());
        let err = run_script(&mut ex, "# header\nfrobnicate\n").unwrap_err();
        assert!(matches!(err, HalError::Parse { line: 2, .. }));
        assert_eq!(run_script(&mut ex, "newsig b bit\nstart\n").unwrap(), 2);
        assert!(store.threads_running());
    }
}
