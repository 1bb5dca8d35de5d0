//! # RTX HAL
//!
//! The object store of an RTX session: components, pins, params, signals,
//! threads, functions, rings and groups living in one shared arena, plus
//! the text command model that manipulates them.
//!
//! ## Objects
//!
//! Every object starts with an [`ObjectHeader`] (id, type, owner id, name).
//! References between objects are ids, never addresses, so the graph reads
//! the same from every attached process. Ids start at 1 and are never
//! reused.
//!
//! ```text
//! comp ─┬─ pin ──(signal_id)──▶ signal ◀──(sig_id)── member ── group
//!       ├─ param
//!       ├─ funct ◀──(id list)── thread
//!       └─ inst ── pin/param/funct
//! ```
//!
//! ## Locking
//!
//! Structural changes go through a [`HalGuard`], which holds the store
//! mutex. Values live in atomic cells: realtime code reads and writes them
//! through [`PinRef`] and [`ParamRef`] without locking.
//!
//! ## Usage
//!
//! ```rust
//! use rtx_hal::{CompKind, HalStore, HalType, HalValue, PinDir};
//!
//! # fn main() -> Result<(), rtx_hal::HalError> {
//! let store = HalStore::in_memory(256 * 1024, 256)?;
//! let mut g = store.lock()?;
//! let c = g.comp_new("panel", CompKind::Remote, 0)?;
//! g.pin_new(c, "panel.speed", HalType::Float, PinDir::In, 0)?;
//! g.net("speed", &["panel.speed"])?;
//! g.sets("speed", "1.5")?;
//! assert_eq!(g.pin_get("panel.speed")?, HalValue::Float(1.5));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod comp;
pub mod error;
pub mod group;
pub mod matcher;
pub mod object;
pub mod pin;
pub mod ring;
pub mod save;
pub mod signal;
pub mod store;
pub mod thread;
pub mod value;

pub use command::{Command, CommandResult, CommandTarget, HalExecutor, parse_line, run_script};
pub use comp::{CompInfo, CompKind, CompState, InstInfo};
pub use error::{HalError, HalResult};
pub use group::{GroupFlags, GroupInfo, MemberInfo};
pub use matcher::CompiledSet;
pub use object::{ObjectFilter, ObjectFlags, ObjectHeader, ObjectRef, ObjectType, Visit, glob_match};
pub use pin::{ParamInfo, ParamRef, PinInfo, PinRef};
pub use ring::RingInfo;
pub use save::{SaveScope, save};
pub use signal::{NetOutcome, SignalInfo};
pub use store::{HAL_LAYOUT_VERSION, HAL_MAGIC, HalGuard, HalStore};
pub use thread::{FunctEntry, FunctInfo, ThreadFlags, ThreadInfo, ThreadSpec};
pub use value::{HalType, HalValue, ParamDir, PinDir};
