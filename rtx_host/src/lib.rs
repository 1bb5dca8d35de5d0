//! # RTX Module Host
//!
//! Runs realtime modules against the object store of a session.
//!
//! ## Responsibilities
//!
//! - Resolve modules by name ([`ModuleRegistry`]) and keep them in load order
//! - Hold the function bodies the object store refers to by handle
//!   ([`FunctionTable`])
//! - Drive every store thread with a flavor task ([`ThreadManager`])
//! - Share vtables between modules with reference counting ([`VtableRegistry`])
//! - Answer command lines on a unix socket ([`CommandServer`])
//!
//! ## Unload order
//!
//! `unloadrt all` walks the load-order list backwards so dependents go
//! before their dependencies. Modules exporting vtables are left for a
//! final pass.
//!
//! ```rust
//! use rtx_common::flavor::Flavor;
//! use rtx_hal::{CommandTarget, HalStore};
//! use rtx_host::{ModuleHost, ModuleRegistry};
//! use std::sync::Arc;
//!
//! let store = Arc::new(HalStore::in_memory(256 * 1024, 256).unwrap());
//! let mut host = ModuleHost::new(store, None, Flavor::Posix, ModuleRegistry::with_builtins());
//! assert!(host.execute_line("loadrt logic count=4").is_ok());
//! assert!(host.execute_line("unloadrt all").is_ok());
//! assert!(host.loaded().is_empty());
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod error;
pub mod functions;
pub mod hardening;
pub mod host;
pub mod module;
pub mod modules;
pub mod registry;
pub mod threads;
pub mod vtable;

pub use channel::{CommandServer, send_command};
pub use error::{HostError, HostResult};
pub use functions::{FunctBody, FunctionTable};
pub use hardening::{HardeningReport, harden};
pub use host::{ModuleHost, reply};
pub use module::{ModuleContext, ModuleFactory, RtModule, parse_arg};
pub use registry::ModuleRegistry;
pub use threads::ThreadManager;
pub use vtable::VtableRegistry;
