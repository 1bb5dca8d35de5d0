//! Global session segment.
//!
//! One per instance, created by the message daemon. The data area holds:
//!
//! ```text
//! [GlobalData 128][message ring][arena heap ...]
//! ```
//!
//! The creator fills everything while the state reads `Initializing` and
//! flips it to `Ready` last. Attachers wait (bounded) for `Ready`; a session
//! in `Exited` is refused.

use crate::error::{ShmError, ShmResult};
use crate::heap::{Heap, HeapHeader, HeapStats};
use crate::key::SegmentKey;
use crate::log::MsgOrigin;
use crate::mutex::{ShmMutex, SpinBudget};
use crate::platform::get_current_pid;
use crate::ring::{RingBuffer, RingConfig};
use crate::segment::{Segment, SegmentManager};
use rtx_common::config::{LogLevel, SessionConfig};
use rtx_common::flavor::Flavor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Magic of the global session segment.
pub const GLOBAL_MAGIC: u32 = 0x4744_4154;

/// Layout version of [`GlobalData`].
pub const GLOBAL_LAYOUT_VERSION: u32 = 1;

/// Name of the session message ring.
pub const MESSAGE_RING_NAME: &str = "rtapi_message";

const GLOBAL_DATA_SIZE: usize = 128;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionState {
    /// Fields are being filled in; nothing is valid yet.
    Initializing = 1,
    /// Ring and heap are usable.
    Ready = 2,
    /// The daemon shut the session down.
    Exited = 3,
}

impl SessionState {
    fn from_u32(v: u32) -> Self {
        match v {
            2 => SessionState::Ready,
            3 => SessionState::Exited,
            _ => SessionState::Initializing,
        }
    }
}

/// Session-wide state at the start of the global segment.
#[repr(C, align(64))]
pub struct GlobalData {
    state: AtomicU32,
    instance: u32,
    flavor: u32,
    rt_msg_level: AtomicU32,
    user_msg_level: AtomicU32,
    next_handle: AtomicU32,
    msgd_pid: AtomicU32,
    host_pid: AtomicU32,
    hal_size: u64,
    ring_off: u32,
    ring_size: u32,
    mutex: ShmMutex,
    _pad: u32,
    heap: HeapHeader,
    started_ts: AtomicU64,
    _reserved: [u8; 32],
}

static_assertions::const_assert_eq!(std::mem::size_of::<GlobalData>(), GLOBAL_DATA_SIZE);

/// Handle to the session of one instance.
pub struct Session {
    segment: Arc<Segment>,
    ring: RingBuffer,
}

impl Session {
    /// Create the session segment. Only the message daemon does this.
    pub fn create(mgr: &SegmentManager, config: &SessionConfig, flavor: Flavor) -> ShmResult<Self> {
        let ring_cfg = RingConfig::record(config.message_ring_size & !7).multi_writer();
        ring_cfg.validate()?;
        let ring_off = GLOBAL_DATA_SIZE;
        let heap_start = (ring_off + ring_cfg.total_size()).next_multiple_of(64);
        if heap_start >= config.global_size {
            return Err(ShmError::InvalidSize {
                size: config.global_size,
            });
        }

        let segment = Arc::new(mgr.create(
            SegmentKey::global(config.instance),
            config.global_size,
            GLOBAL_MAGIC,
            GLOBAL_LAYOUT_VERSION,
        )?);
        let gd = segment.data_ptr() as *mut GlobalData;
        // SAFETY: fresh segment, data area is zeroed and larger than GlobalData;
        // nobody reads fields before the state is Ready.
        unsafe {
            let g = &mut *gd;
            g.state.store(SessionState::Initializing as u32, Ordering::Release);
            g.instance = config.instance as u32;
            g.flavor = flavor.id();
            g.rt_msg_level.store(config.rt_msg_level.code(), Ordering::Relaxed);
            g.user_msg_level
                .store(config.user_msg_level.code(), Ordering::Relaxed);
            g.next_handle.store(1, Ordering::Relaxed);
            g.msgd_pid.store(get_current_pid(), Ordering::Relaxed);
            g.hal_size = config.hal_size as u64;
            g.ring_off = ring_off as u32;
            g.ring_size = ring_cfg.capacity as u32;
            g.started_ts.store(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
                Ordering::Relaxed,
            );
            Heap::init(
                segment.data_ptr(),
                std::ptr::addr_of_mut!((*gd).heap),
                heap_start as u32,
                segment.data_size() as u32,
            );
        }
        // SAFETY: [ring_off, heap_start) is reserved for the ring.
        let ring = unsafe {
            RingBuffer::init_in(segment.clone(), ring_off as u32, MESSAGE_RING_NAME, &ring_cfg)?
        };
        let session = Self { segment, ring };
        session
            .global()
            .state
            .store(SessionState::Ready as u32, Ordering::Release);
        info!(
            "Session {} ready (flavor {}, ring {} bytes)",
            config.instance, flavor, ring_cfg.capacity
        );
        Ok(session)
    }

    /// Attach to the session of `instance`, waiting until it is ready.
    pub fn attach(
        mgr: &SegmentManager,
        instance: u8,
        retries: u32,
        interval: Duration,
    ) -> ShmResult<Self> {
        let key = SegmentKey::global(instance);
        let name = key.file_name();
        for attempt in 0..retries.max(1) {
            match mgr.attach(key, GLOBAL_MAGIC, GLOBAL_LAYOUT_VERSION) {
                Ok(segment) => {
                    if segment.data_size() < GLOBAL_DATA_SIZE {
                        return Err(ShmError::InvalidSize {
                            size: segment.data_size(),
                        });
                    }
                    let segment = Arc::new(segment);
                    // SAFETY: size checked above.
                    let gd = unsafe { &*(segment.data_ptr() as *const GlobalData) };
                    match SessionState::from_u32(gd.state.load(Ordering::Acquire)) {
                        SessionState::Ready => {
                            let ring_off = gd.ring_off;
                            // SAFETY: the creator initialised the ring at ring_off.
                            let ring = unsafe {
                                RingBuffer::attach_in(segment.clone(), ring_off, MESSAGE_RING_NAME)?
                            };
                            debug!("Attached session {} after {} attempts", instance, attempt + 1);
                            return Ok(Self { segment, ring });
                        }
                        SessionState::Exited => return Err(ShmError::SessionExited { name }),
                        SessionState::Initializing => {}
                    }
                }
                Err(ShmError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            std::thread::sleep(interval);
        }
        Err(ShmError::StartupTimeout {
            name,
            attempts: retries.max(1),
        })
    }

    /// [`Session::attach`] with the configured instance and wait.
    pub fn attach_configured(mgr: &SegmentManager, config: &SessionConfig) -> ShmResult<Self> {
        Self::attach(
            mgr,
            config.instance,
            config.startup_retries,
            config.retry_interval(),
        )
    }

    fn global(&self) -> &GlobalData {
        // SAFETY: validated at create/attach.
        unsafe { &*(self.segment.data_ptr() as *const GlobalData) }
    }

    /// Underlying segment.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Instance id.
    pub fn instance(&self) -> u8 {
        self.global().instance as u8
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u32(self.global().state.load(Ordering::Acquire))
    }

    /// Tell attachers the session is gone.
    pub fn mark_exited(&self) {
        self.global()
            .state
            .store(SessionState::Exited as u32, Ordering::Release);
    }

    /// Flavor chosen by the creator.
    pub fn flavor(&self) -> Option<Flavor> {
        Flavor::from_id(self.global().flavor)
    }

    /// Verbosity for messages of `origin`.
    pub fn msg_level(&self, origin: MsgOrigin) -> LogLevel {
        let cell = match origin {
            MsgOrigin::Rt | MsgOrigin::Kernel => &self.global().rt_msg_level,
            MsgOrigin::User => &self.global().user_msg_level,
        };
        LogLevel::from_code(cell.load(Ordering::Relaxed))
    }

    /// Change the verbosity for messages of `origin`. Returns the old level.
    pub fn set_msg_level(&self, origin: MsgOrigin, level: LogLevel) -> LogLevel {
        let cell = match origin {
            MsgOrigin::Rt | MsgOrigin::Kernel => &self.global().rt_msg_level,
            MsgOrigin::User => &self.global().user_msg_level,
        };
        LogLevel::from_code(cell.swap(level.code(), Ordering::Relaxed))
    }

    /// Next session-unique handle, starting at 1.
    pub fn next_handle(&self) -> u32 {
        self.global().next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// The session message ring.
    pub fn message_ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Configured object store size.
    pub fn hal_size(&self) -> usize {
        self.global().hal_size as usize
    }

    /// Creation time in ns since the epoch.
    pub fn started_ts(&self) -> u64 {
        self.global().started_ts.load(Ordering::Relaxed)
    }

    /// Pid of the message daemon.
    pub fn msgd_pid(&self) -> u32 {
        self.global().msgd_pid.load(Ordering::Acquire)
    }

    /// Pid of the module host, `0` when none.
    pub fn host_pid(&self) -> u32 {
        self.global().host_pid.load(Ordering::Acquire)
    }

    /// Publish (or clear with `0`) the module host pid.
    pub fn set_host_pid(&self, pid: u32) {
        self.global().host_pid.store(pid, Ordering::Release);
    }

    /// Run `f` on the session heap under the session mutex.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<'_>) -> R) -> ShmResult<R> {
        let _guard = self.global().mutex.lock(SpinBudget::USER, "session heap")?;
        let gd = self.segment.data_ptr() as *mut GlobalData;
        // SAFETY: the heap header was initialised at creation; the mutex
        // makes this the only view.
        let mut heap =
            unsafe { Heap::from_raw(self.segment.data_ptr(), std::ptr::addr_of_mut!((*gd).heap)) };
        Ok(f(&mut heap))
    }

    /// Session heap usage.
    pub fn heap_stats(&self) -> ShmResult<HeapStats> {
        self.with_heap(|h| h.stats())
    }
}
