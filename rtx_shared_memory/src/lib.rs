//! # RTX Shared Memory
//!
//! Shared-memory substrate of an RTX session: named segments with owner
//! liveness, an offset-addressed arena heap, bounded try-lock mutexes, ring
//! buffers and the global session segment with its message ring.
//!
//! ## Segment naming
//!
//! Segments are identified by a 32-bit [`SegmentKey`]: the low 24 bits name
//! the purpose (session, object store, scheduler data, ring), the high byte
//! the instance. Several instances coexist on one host.
//!
//! ```text
//! rtx-00154711   session of instance 0
//! rtx-01414c32   object store of instance 1
//! rtx-0052xxxx   ring segment of instance 0
//! ```
//!
//! ## Layout
//!
//! ```text
//! ┌────────────────────┬─────────────────────────────────────────┐
//! │ SegmentHeader 128B │ data (GlobalData | ring | heap arena)   │
//! └────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! Everything inside a data area is addressed by offset, so the same
//! structures are valid in every process regardless of mapping address.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rtx_shared_memory::{RingBuffer, RingConfig, SegmentManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mgr = SegmentManager::new("/dev/shm");
//! let ring = RingBuffer::create_segment(&mgr, "samples", 0, &RingConfig::record(4096))?;
//! ring.record_writer()?.write(b"42")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod discovery;
pub mod error;
pub mod heap;
pub mod key;
pub mod log;
pub mod mutex;
pub mod platform;
pub mod ring;
pub mod ring_log;
pub mod segment;
pub mod session;

pub use discovery::{SegmentDiscovery, SegmentInfo};
pub use error::{ShmError, ShmResult};
pub use heap::{Heap, HeapHeader, HeapStats, ShmOff};
pub use key::{SegmentKey, SegmentPurpose};
pub use log::{LogRecord, MsgOrigin};
pub use mutex::{ShmMutex, ShmMutexGuard, SpinBudget};
pub use ring::{
    Frame, FrameFlags, MultipartReader, MultipartWriter, RecordReader, RecordWriter, RingBuffer,
    RingConfig, RingMode, RingStats, StreamReader, StreamWriter, WriterMode,
};
pub use ring_log::RingLogLayer;
pub use segment::{OwnerState, Segment, SegmentHeader, SegmentManager};
pub use session::{Session, SessionState};

pub use rtx_common::consts::{SHM_MAX_SIZE, SHM_MIN_SIZE};
