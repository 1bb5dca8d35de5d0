//! # RTX Message Daemon
//!
//! The first process of a session and the last one to leave it.
//!
//! ## Responsibilities
//!
//! - Create the global session segment and mark it READY
//! - Drain the session message ring with an adaptive poll interval
//!   ([`AdaptivePoll`]) into a [`LogSink`] and, optionally, a [`Publisher`]
//! - Surface ring overflows as warnings
//! - Watch the module host pid ([`HostWatch`]) and shut down when the host
//!   leaves or dies
//! - On shutdown mark the session EXITED and unlink all instance segments
//!
//! The daemon never forwards its own tracing output into the ring it drains.

#![warn(missing_docs)]

pub mod daemon;
pub mod error;
pub mod poll;
pub mod publisher;
pub mod sink;
pub mod supervise;

pub use daemon::{MsgDaemon, Overflow, StopReason};
pub use error::{DaemonError, DaemonResult};
pub use poll::AdaptivePoll;
pub use publisher::Publisher;
pub use sink::{LogSink, format_line};
pub use supervise::{HostStatus, HostWatch};
