//! Message daemon errors.

use rtx_common::config::ConfigError;
use rtx_common::flavor::FlavorError;
use rtx_shared_memory::ShmError;
use thiserror::Error;

/// Errors of the message daemon
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Shared memory failure
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Requested flavor unknown or incompatible with the kernel
    #[error(transparent)]
    Flavor(#[from] FlavorError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Log file or socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encoding for subscribers failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The module host process died without clearing its pid
    #[error("Module host (pid {pid}) died")]
    HostDied {
        /// Last known host pid
        pid: u32,
    },
}

/// Result type for message daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
