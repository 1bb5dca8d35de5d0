//! RTX Common Library
//!
//! Shared constants, configuration loading and the realtime flavor
//! abstraction used by every RTX crate.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment keys, sizing defaults, name limits
//! - [`config`] - Configuration loading traits and types
//! - [`flavor`] - Scheduling backends, priority mapping, periodic tasks
//! - [`signals`] - Termination and crash signal handling
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! rtx_common = { workspace = true }
//! ```

pub mod config;
pub mod consts;
pub mod flavor;
pub mod prelude;
pub mod signals;
