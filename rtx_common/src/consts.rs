//! System-wide constants for the RTX workspace.
//!
//! Single source of truth for segment keys, sizing defaults, name limits and
//! polling intervals. Imported by all crates, no duplication permitted.

// ─── Segment keys ───────────────────────────────────────────────────

/// Base key of the global session segment.
pub const GLOBAL_KEY: u32 = 0x0015_4711;

/// Base key of the scheduler bookkeeping segment (flavors with `DATA_IN_SHM`).
pub const RTAPI_KEY: u32 = 0x0028_0A48;

/// Base key of the object store (HAL) segment.
pub const HAL_KEY: u32 = 0x0041_4C32;

/// Base key for named ring segments. The low 16 bits carry a hash of the ring name.
pub const RING_KEY_BASE: u32 = 0x0052_0000;

/// Bit position of the instance id inside a segment key.
pub const INSTANCE_SHIFT: u32 = 24;

/// Mask selecting the purpose bits of a segment key.
pub const PURPOSE_MASK: u32 = 0x00FF_FFFF;

// ─── Segment files ──────────────────────────────────────────────────

/// Default directory holding segment files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// File name prefix of every segment created by this workspace.
pub const SHM_PREFIX: &str = "rtx";

/// Size of the header at the start of every segment.
pub const SEGMENT_HEADER_SIZE: usize = 128;

/// Smallest accepted segment data size.
pub const SHM_MIN_SIZE: usize = 256;

/// Largest accepted segment data size (1 GiB).
pub const SHM_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Cache line size used for header alignment.
pub const CACHE_LINE_SIZE: usize = 64;

// ─── Session sizing ─────────────────────────────────────────────────

/// Default data size of the global session segment.
pub const DEFAULT_GLOBAL_SIZE: usize = 1024 * 1024;

/// Default capacity of the session message ring.
pub const DEFAULT_MESSAGE_RING_SIZE: usize = 256 * 1024;

/// Default data size of the object store segment.
pub const DEFAULT_HAL_SIZE: usize = 2 * 1024 * 1024;

/// Default capacity of the object table.
pub const DEFAULT_OBJECT_TABLE_CAPACITY: u32 = 4096;

/// Startup wait: number of attempts before giving up on a session.
pub const STARTUP_RETRIES: u32 = 10;

/// Startup wait: interval between attempts in milliseconds.
pub const STARTUP_RETRY_INTERVAL_MS: u64 = 500;

// ─── Object store ───────────────────────────────────────────────────

/// Storage size of an object name, including the terminating NUL.
pub const HAL_NAME_LEN: usize = 48;

/// Number of float comparison tolerances in the epsilon table.
pub const MAX_EPSILON: usize = 5;

/// Default float comparison tolerance.
pub const DEFAULT_EPSILON: f64 = 0.00001;

/// Maximum number of functions one thread can run.
pub const MAX_FUNCTS_PER_THREAD: usize = 64;

// ─── Message daemon ─────────────────────────────────────────────────

/// Fastest message ring poll interval in milliseconds.
pub const POLL_MIN_MS: u64 = 20;

/// Slowest message ring poll interval in milliseconds.
pub const POLL_MAX_MS: u64 = 200;

/// Poll interval increase per idle cycle in milliseconds.
pub const POLL_STEP_MS: u64 = 10;

/// Host liveness check interval in milliseconds.
pub const SUPERVISE_INTERVAL_MS: u64 = 1000;

// ─── Module host ────────────────────────────────────────────────────

/// Default size of the buffer pre-faulted at host startup (8 MiB).
pub const DEFAULT_PREFAULT_BYTES: usize = 8 * 1024 * 1024;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rtx/rtx.toml";
