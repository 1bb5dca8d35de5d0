//! Object store errors

use rtx_shared_memory::ShmError;
use thiserror::Error;

/// Errors returned by object store operations and commands
#[derive(Error, Debug)]
pub enum HalError {
    /// No object of this kind and name
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Requested name
        name: String,
    },

    /// Name already taken within its kind
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Duplicate name
        name: String,
    },

    /// Pin and signal types differ
    #[error("Type mismatch: signal '{signal}' is {signal_type}, pin '{pin}' is {pin_type}")]
    TypeMismatch {
        /// Signal name
        signal: String,
        /// Pin name
        pin: String,
        /// Signal value type
        signal_type: &'static str,
        /// Pin value type
        pin_type: &'static str,
    },

    /// Signal already has a writer or bidirectional pin
    #[error("Signal '{signal}' already has {existing}, cannot link '{pin}'")]
    CardinalityViolation {
        /// Signal name
        signal: String,
        /// Rejected pin
        pin: String,
        /// What the signal already has ("a writer", "a bidir")
        existing: &'static str,
    },

    /// Pin is linked to another signal
    #[error("Pin '{pin}' is already linked to signal '{signal}'")]
    AlreadyLinked {
        /// Pin name
        pin: String,
        /// Current signal
        signal: String,
    },

    /// Heap or object table full
    #[error("Object store full: {what}")]
    AllocationExhausted {
        /// Exhausted resource
        what: &'static str,
    },

    /// Object name is empty, too long or has whitespace
    #[error("Invalid name '{name}'")]
    InvalidName {
        /// Rejected name
        name: String,
    },

    /// Malformed or out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Object is not in a state allowing the operation
    #[error("'{name}' is {state}, expected {expected}")]
    InvalidState {
        /// Object name
        name: String,
        /// Current state
        state: &'static str,
        /// Required state
        expected: &'static str,
    },

    /// Non-reentrant function is already on a thread
    #[error("Function '{funct}' is not reentrant and already in use")]
    NotReentrant {
        /// Function name
        funct: String,
    },

    /// Floating point function on a non-FP thread
    #[error("Function '{funct}' needs floating point, thread '{thread}' has none")]
    NeedsFp {
        /// Function name
        funct: String,
        /// Thread name
        thread: String,
    },

    /// Function position out of range
    #[error("Position {position} invalid for thread '{thread}' with {count} functions")]
    BadPosition {
        /// Thread name
        thread: String,
        /// Requested position
        position: i32,
        /// Current function count
        count: usize,
    },

    /// Write to a read-only object
    #[error("'{name}' is read-only: {reason}")]
    ReadOnly {
        /// Object name
        name: String,
        /// Why
        reason: &'static str,
    },

    /// Object is still referenced
    #[error("'{name}' is in use: {reason}")]
    InUse {
        /// Object name
        name: String,
        /// Reference holder
        reason: String,
    },

    /// Command line could not be parsed
    #[error("Line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What is wrong
        reason: String,
    },

    /// Script command failed
    #[error("Line {line}: {message}")]
    CommandFailed {
        /// 1-based line number
        line: usize,
        /// Result code of the command
        code: i32,
        /// Notes of the failed command
        message: String,
    },

    /// Command cannot run on this target
    #[error("Command '{0}' not supported here")]
    Unsupported(String),

    /// Shared memory failure
    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Result type for object store operations
pub type HalResult<T> = Result<T, HalError>;

impl HalError {
    /// Negative errno-style result code for command replies.
    pub fn code(&self) -> i32 {
        if let HalError::CommandFailed { code, .. } = self {
            return *code;
        }
        -match self {
            HalError::NotFound { .. } => libc::ENOENT,
            HalError::AlreadyExists { .. } => libc::EEXIST,
            HalError::AllocationExhausted { .. } => libc::ENOMEM,
            HalError::InvalidState { .. } | HalError::InUse { .. } => libc::EBUSY,
            HalError::ReadOnly { .. } => libc::EPERM,
            HalError::Unsupported(_) => libc::ENOSYS,
            HalError::TypeMismatch { .. }
            | HalError::CardinalityViolation { .. }
            | HalError::AlreadyLinked { .. }
            | HalError::InvalidName { .. }
            | HalError::InvalidArgument(_)
            | HalError::NotReentrant { .. }
            | HalError::NeedsFp { .. }
            | HalError::BadPosition { .. }
            | HalError::Parse { .. } => libc::EINVAL,
            HalError::CommandFailed { .. } => libc::EIO,
            HalError::Shm(e) => match e {
                ShmError::NotFound { .. } => libc::ENOENT,
                ShmError::AlreadyExists { .. } => libc::EEXIST,
                ShmError::AllocationExhausted { .. } => libc::ENOMEM,
                ShmError::LockTimeout { .. } | ShmError::WouldBlock => libc::EAGAIN,
                ShmError::PermissionDenied { .. } => libc::EACCES,
                _ => libc::EIO,
            },
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        HalError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_errno() {
        assert_eq!(HalError::not_found("pin", "x").code(), -libc::ENOENT);
        assert_eq!(
            HalError::AllocationExhausted { what: "heap" }.code(),
            -libc::ENOMEM
        );
        assert_eq!(HalError::Shm(ShmError::WouldBlock).code(), -libc::EAGAIN);
        assert!(HalError::InvalidArgument("x".into()).code() < 0);
    }
}
