//! Module host errors

use rtx_common::config::ConfigError;
use rtx_common::flavor::FlavorError;
use rtx_hal::HalError;
use rtx_shared_memory::ShmError;
use thiserror::Error;

/// Errors returned by the module host
#[derive(Error, Debug)]
pub enum HostError {
    /// No factory registered under this name
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Module is already in the load-order list
    #[error("Module '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// Module is not in the load-order list
    #[error("Module '{0}' is not loaded")]
    NotLoaded(String),

    /// A load or instance argument was rejected
    #[error("Module '{module}': bad parameter '{param}': {reason}")]
    InvalidParam {
        /// Module name
        module: String,
        /// Parameter name
        param: String,
        /// Why it was rejected
        reason: String,
    },

    /// The start entry point of a module failed
    #[error("Module '{module}' failed to start: {reason}")]
    StartFailed {
        /// Module name
        module: String,
        /// Failure reported by the module
        reason: String,
    },

    /// Module does not support instances
    #[error("Module '{0}' cannot be instantiated")]
    NotInstantiable(String),

    /// No instance with this name belongs to a loaded module
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// A vtable of this module is still referenced
    #[error("Vtable '{name}' v{version} is referenced {refs} time(s)")]
    VtableInUse {
        /// Vtable name
        name: String,
        /// Vtable version
        version: u32,
        /// Outstanding references
        refs: u32,
    },

    /// No vtable with this name and version
    #[error("Vtable '{name}' v{version} not found")]
    VtableNotFound {
        /// Vtable name
        name: String,
        /// Vtable version
        version: u32,
    },

    /// A vtable with this name and version is already exported
    #[error("Vtable '{name}' v{version} already exported by '{module}'")]
    VtableExists {
        /// Vtable name
        name: String,
        /// Vtable version
        version: u32,
        /// Exporting module
        module: String,
    },

    /// Process hardening step failed on a flavor that requires it
    #[error("Hardening step '{step}' failed: {source}")]
    Hardening {
        /// Step name
        step: &'static str,
        /// Underlying error
        #[source]
        source: ShmError,
    },

    /// Object store failure
    #[error(transparent)]
    Hal(#[from] HalError),

    /// Shared memory failure
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Flavor selection or task failure
    #[error(transparent)]
    Flavor(#[from] FlavorError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Socket or file failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply encoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for module host operations
pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    /// Negative errno-style result code for command replies.
    pub fn code(&self) -> i32 {
        match self {
            HostError::Hal(e) => e.code(),
            HostError::Shm(e) => shm_code(e),
            HostError::ModuleNotFound(_)
            | HostError::NotLoaded(_)
            | HostError::InstanceNotFound(_)
            | HostError::VtableNotFound { .. } => -libc::ENOENT,
            HostError::AlreadyLoaded(_) | HostError::VtableExists { .. } => -libc::EEXIST,
            HostError::VtableInUse { .. } => -libc::EBUSY,
            HostError::InvalidParam { .. } | HostError::Flavor(_) | HostError::Config(_) => {
                -libc::EINVAL
            }
            HostError::NotInstantiable(_) => -libc::ENOSYS,
            HostError::Hardening { .. } => -libc::EPERM,
            HostError::StartFailed { .. } | HostError::Io(_) | HostError::Json(_) => -libc::EIO,
        }
    }

    pub(crate) fn param(module: &str, param: &str, reason: impl Into<String>) -> Self {
        HostError::InvalidParam {
            module: module.to_string(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}

fn shm_code(e: &ShmError) -> i32 {
    -match e {
        ShmError::NotFound { .. } => libc::ENOENT,
        ShmError::AlreadyExists { .. } => libc::EEXIST,
        ShmError::AllocationExhausted { .. } => libc::ENOMEM,
        ShmError::LockTimeout { .. } | ShmError::WouldBlock => libc::EAGAIN,
        ShmError::StartupTimeout { .. } => libc::ETIMEDOUT,
        ShmError::PermissionDenied { .. } => libc::EACCES,
        _ => libc::EIO,
    }
}
