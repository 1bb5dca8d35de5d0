//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists and its owner is alive
    #[error("Segment already exists: {name} (owner pid {owner_pid})")]
    AlreadyExists {
        /// Segment name
        name: String,
        /// Pid recorded in the segment header
        owner_pid: u32,
    },

    /// Segment not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Segment magic or layout version differ from what the caller expects
    #[error(
        "Incompatible segment {name}: magic {found_magic:#010x} v{found_version}, expected {expected_magic:#010x} v{expected_version}"
    )]
    VersionMismatch {
        /// Segment name
        name: String,
        /// Magic the caller expects
        expected_magic: u32,
        /// Magic found in the segment
        found_magic: u32,
        /// Layout version the caller expects
        expected_version: u32,
        /// Layout version found in the segment
        found_version: u32,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Heap or fixed-size table exhausted
    #[error("Allocation of {requested} bytes failed ({available} bytes free)")]
    AllocationExhausted {
        /// Requested bytes
        requested: usize,
        /// Free bytes at the time of the request
        available: usize,
    },

    /// Offset handed to the heap does not designate a live block
    #[error("Invalid heap block at offset {offset:#x}")]
    InvalidBlock {
        /// Offending offset
        offset: u32,
    },

    /// Session never reached the ready state
    #[error("Session segment {name} not ready after {attempts} attempts")]
    StartupTimeout {
        /// Segment name
        name: String,
        /// Attempts made
        attempts: u32,
    },

    /// Session has been shut down by its daemon
    #[error("Session segment {name} has exited")]
    SessionExited {
        /// Segment name
        name: String,
    },

    /// Segment mutex could not be taken within the spin budget
    #[error("Lock on {what} not acquired (held by pid {holder})")]
    LockTimeout {
        /// Protected structure
        what: &'static str,
        /// Pid holding the lock
        holder: u32,
    },

    /// Ring is full
    #[error("Ring full")]
    WouldBlock,

    /// Ring holds no data
    #[error("Ring empty")]
    Empty,

    /// Record larger than the ring can ever hold
    #[error("Record of {size} bytes exceeds ring limit of {max} bytes")]
    RecordTooLarge {
        /// Record size
        size: usize,
        /// Largest acceptable record
        max: usize,
    },

    /// Single-writer ring already has a writer
    #[error("Ring already has a writer")]
    WriterBusy,

    /// Ring already has a reader
    #[error("Ring already has a reader")]
    ReaderBusy,

    /// Ring parameters or contents are invalid
    #[error("Invalid ring: {reason}")]
    InvalidRing {
        /// What is wrong
        reason: String,
    },

    /// Permission denied
    #[error("Permission denied accessing segment: {name}")]
    PermissionDenied {
        /// Segment name
        name: String,
    },

    /// Process not found or already dead
    #[error("Process not found: {pid}")]
    ProcessNotFound {
        /// Process ID
        pid: u32,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// Log record encoding error
    #[error("Encoding error: {source}")]
    Encoding {
        /// Source bincode error
        #[from]
        source: bincode::Error,
    },
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

impl ShmError {
    /// Whether the caller may retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShmError::WouldBlock | ShmError::Empty | ShmError::LockTimeout { .. }
        )
    }
}
