//! Prelude module for common re-exports.
//!
//! ```rust
//! use rtx_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, HostConfig, MsgdConfig, RtxConfig, SessionConfig, SharedConfig,
};

// ─── Flavors ────────────────────────────────────────────────────────
pub use crate::flavor::{Flavor, FlavorError, KernelMarkers, Task, TaskSpec, select_flavor};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_SHM_DIR, GLOBAL_KEY, HAL_KEY, HAL_NAME_LEN, RTAPI_KEY};
