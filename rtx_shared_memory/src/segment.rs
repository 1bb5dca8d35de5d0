//! Shared memory segment structures and operations
//!
//! Segments are files in the segment directory (normally `/dev/shm`) named
//! after their [`SegmentKey`]. The creating process holds an exclusive
//! `flock` on the file for as long as it lives; that lock is the liveness
//! probe. A segment whose lock can be taken has no owner and is reclaimed by
//! the next creator.
//!
//! Creation is atomic: the segment is built under a private temporary name and
//! published with `link(2)`, which fails if the final name exists. Of two
//! concurrent creators exactly one succeeds.

use crate::error::{ShmError, ShmResult};
use crate::key::SegmentKey;
use crate::platform::linux::page_size;
use crate::platform::{attach_segment_mmap, create_segment_mmap, get_current_pid, try_lock_exclusive};
use memmap2::MmapMut;
use rtx_common::config::SessionConfig;
use rtx_common::consts::{SEGMENT_HEADER_SIZE, SHM_MAX_SIZE, SHM_MIN_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const CREATE_ATTEMPTS: u32 = 3;

/// Segment header with cache-line alignment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number of the segment user; written last on creation
    pub magic: AtomicU32,
    /// Layout version of the segment user
    pub layout_version: u32,
    /// Raw segment key
    pub key: u32,
    /// Reserved
    pub flags: u32,
    /// Data section size
    pub data_size: u64,
    /// Creation timestamp (ns since the epoch)
    pub created_ts: u64,
    /// Creator process ID
    pub owner_pid: AtomicU32,
    /// Number of non-owner attachments
    pub attach_count: AtomicU32,
    /// Cache line padding to ensure 128-byte header
    _padding: [u8; 88],
}

static_assertions::const_assert_eq!(std::mem::size_of::<SegmentHeader>(), SEGMENT_HEADER_SIZE);

/// Byte offset of `owner_pid` inside the header.
const OWNER_PID_OFFSET: u64 = 32;

impl SegmentHeader {
    fn new(key: SegmentKey, data_size: usize, version: u32) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            magic: AtomicU32::new(0),
            layout_version: version,
            key: key.raw(),
            flags: 0,
            data_size: data_size as u64,
            created_ts: now,
            owner_pid: AtomicU32::new(get_current_pid()),
            attach_count: AtomicU32::new(0),
            _padding: [0; 88],
        }
    }
}

/// Liveness of whatever occupies a segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    /// No segment with this key.
    Absent,
    /// Segment exists and its creator is running.
    Live {
        /// Creator pid from the header
        pid: u32,
    },
    /// Segment exists but nobody holds it.
    Stale {
        /// Creator pid from the header
        pid: u32,
    },
}

/// A mapped segment.
pub struct Segment {
    key: SegmentKey,
    path: Option<PathBuf>,
    _file: Option<File>,
    _mmap: MmapMut,
    base: NonNull<u8>,
    data_size: usize,
    owner: bool,
    reclaimed: bool,
}

// SAFETY: the mapping is shared memory accessed through atomics and
// mutex-guarded views; `base` is owned by `_mmap`, which is Send + Sync.
unsafe impl Send for Segment {}
// SAFETY: see above.
unsafe impl Sync for Segment {}

impl Segment {
    fn from_mapping(
        key: SegmentKey,
        path: Option<PathBuf>,
        file: Option<File>,
        mut mmap: MmapMut,
        data_size: usize,
        owner: bool,
        reclaimed: bool,
    ) -> ShmResult<Self> {
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(ShmError::InvalidSize { size: 0 })?;
        Ok(Self {
            key,
            path,
            _file: file,
            _mmap: mmap,
            base,
            data_size,
            owner,
            reclaimed,
        })
    }

    /// Segment key.
    pub fn key(&self) -> SegmentKey {
        self.key
    }

    /// File backing the segment, `None` for anonymous segments.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether creation replaced a stale segment.
    pub fn reclaimed(&self) -> bool {
        self.reclaimed
    }

    /// Segment header.
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: every mapping starts with an initialised header.
        unsafe { &*(self.base.as_ptr() as *const SegmentHeader) }
    }

    /// Start of the data section. All segment offsets are relative to it.
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: the mapping is at least header + data_size long.
        unsafe { self.base.as_ptr().add(SEGMENT_HEADER_SIZE) }
    }

    /// Size of the data section.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of current non-owner attachments.
    pub fn attach_count(&self) -> u32 {
        self.header().attach_count.load(Ordering::Acquire)
    }

    /// Pid of the creator.
    pub fn owner_pid(&self) -> u32 {
        self.header().owner_pid.load(Ordering::Acquire)
    }

    /// Display name for errors and logs.
    pub fn name(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => format!("anon:{}", self.key),
        }
    }

    /// Unmap. Owners give up their liveness lock; the file stays until unlinked.
    pub fn detach(self) {
        drop(self);
    }

    /// Remove the segment file. Idempotent; existing mappings stay valid.
    pub fn unlink(&self) -> ShmResult<()> {
        match &self.path {
            Some(path) => remove_if_exists(path),
            None => Ok(()),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.owner {
            self.header().attach_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("data_size", &self.data_size)
            .field("owner", &self.owner)
            .finish()
    }
}

fn remove_if_exists(path: &Path) -> ShmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Unlink the stale file at `path` while holding its lock.
///
/// Returns `false` when the file could not be locked or `path` no longer
/// names the locked file, i.e. another creator got there first.
fn reclaim_stale(path: &Path) -> ShmResult<bool> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if !try_lock_exclusive(&file)? {
        return Ok(false);
    }
    let locked = file.metadata()?;
    let current = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if (locked.dev(), locked.ino()) != (current.dev(), current.ino()) {
        return Ok(false);
    }
    remove_if_exists(path)?;
    Ok(true)
}

/// Validate segment data size
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if !(SHM_MIN_SIZE..=SHM_MAX_SIZE).contains(&size) {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

fn mapping_size(data_size: usize) -> usize {
    let page = page_size();
    (SEGMENT_HEADER_SIZE + data_size).div_ceil(page) * page
}

fn write_header(mmap: &mut MmapMut, key: SegmentKey, data_size: usize, magic: u32, version: u32) {
    let hdr = mmap.as_mut_ptr() as *mut SegmentHeader;
    // SAFETY: the mapping is page aligned and longer than the header.
    unsafe {
        hdr.write(SegmentHeader::new(key, data_size, version));
        (*hdr).magic.store(magic, Ordering::Release);
    }
}

static TMP_SEQ: AtomicU32 = AtomicU32::new(0);

/// Creates, attaches and removes segments in one directory.
#[derive(Debug, Clone)]
pub struct SegmentManager {
    dir: PathBuf,
}

impl SegmentManager {
    /// Manager for segments in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Manager for the directory named in the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.shm_dir.clone())
    }

    /// Segment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path of `key`.
    pub fn path_for(&self, key: SegmentKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Whether a segment file exists for `key`.
    pub fn exists(&self, key: SegmentKey) -> bool {
        self.path_for(key).exists()
    }

    /// Check whether a live process owns `key`.
    pub fn probe_owner(&self, key: SegmentKey) -> ShmResult<OwnerState> {
        let path = self.path_for(key);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(OwnerState::Absent),
            Err(e) => return Err(e.into()),
        };
        let mut pid_bytes = [0u8; 4];
        let pid = match file.read_exact_at(&mut pid_bytes, OWNER_PID_OFFSET) {
            Ok(()) => u32::from_ne_bytes(pid_bytes),
            Err(_) => 0,
        };
        if try_lock_exclusive(&file)? {
            Ok(OwnerState::Stale { pid })
        } else {
            Ok(OwnerState::Live { pid })
        }
    }

    /// Create the segment `key` with `data_size` bytes of zeroed data.
    ///
    /// Fails with [`ShmError::AlreadyExists`] if a live owner holds the key.
    /// A stale segment is removed (with a warning) and replaced.
    pub fn create(
        &self,
        key: SegmentKey,
        data_size: usize,
        magic: u32,
        version: u32,
    ) -> ShmResult<Segment> {
        validate_segment_size(data_size)?;
        let total = mapping_size(data_size);
        let path = self.path_for(key);
        let name = path.display().to_string();
        let mut reclaimed = false;
        let mut last_owner = 0;

        for _ in 0..CREATE_ATTEMPTS {
            match self.probe_owner(key)? {
                OwnerState::Live { pid } => {
                    return Err(ShmError::AlreadyExists {
                        name,
                        owner_pid: pid,
                    });
                }
                OwnerState::Stale { pid } => {
                    if !reclaim_stale(&path)? {
                        debug!("Stale segment {} changed hands, probing again", name);
                        continue;
                    }
                    warn!("Reclaimed stale segment {} left by pid {}", name, pid);
                    reclaimed = true;
                }
                OwnerState::Absent => {}
            }

            let tmp = self.dir.join(format!(
                ".{}.{}.{}.tmp",
                key.file_name(),
                get_current_pid(),
                TMP_SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            let (file, mut mmap) = create_segment_mmap(&tmp, total)?;
            let locked = try_lock_exclusive(&file);
            if !matches!(locked, Ok(true)) {
                let _ = std::fs::remove_file(&tmp);
                return Err(locked.err().unwrap_or(ShmError::PermissionDenied { name }));
            }
            write_header(&mut mmap, key, data_size, magic, version);

            let linked = std::fs::hard_link(&tmp, &path);
            let _ = std::fs::remove_file(&tmp);
            match linked {
                Ok(()) => {
                    info!("Created segment {} ({} bytes)", name, data_size);
                    return Segment::from_mapping(
                        key,
                        Some(path),
                        Some(file),
                        mmap,
                        data_size,
                        true,
                        reclaimed,
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!("Lost creation race for {}", name);
                    if let OwnerState::Live { pid } = self.probe_owner(key)? {
                        last_owner = pid;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ShmError::AlreadyExists {
            name,
            owner_pid: last_owner,
        })
    }

    /// Attach to the existing segment `key`. Never creates.
    pub fn attach(&self, key: SegmentKey, magic: u32, version: u32) -> ShmResult<Segment> {
        let path = self.path_for(key);
        let name = path.display().to_string();
        let (file, mmap) = attach_segment_mmap(&path)?;
        if mmap.len() < SEGMENT_HEADER_SIZE {
            return Err(ShmError::InvalidSize { size: mmap.len() });
        }
        let hdr = mmap.as_ptr() as *const SegmentHeader;
        // SAFETY: the mapping is at least one header long.
        let (found_magic, found_version, data_size) = unsafe {
            (
                (*hdr).magic.load(Ordering::Acquire),
                (*hdr).layout_version,
                (*hdr).data_size as usize,
            )
        };
        if found_magic != magic || found_version != version {
            return Err(ShmError::VersionMismatch {
                name,
                expected_magic: magic,
                found_magic,
                expected_version: version,
                found_version,
            });
        }
        if SEGMENT_HEADER_SIZE + data_size > mmap.len() {
            return Err(ShmError::InvalidSize { size: data_size });
        }
        // SAFETY: header validated above.
        unsafe { (*hdr).attach_count.fetch_add(1, Ordering::AcqRel) };
        debug!("Attached segment {}", name);
        Segment::from_mapping(key, Some(path), Some(file), mmap, data_size, false, false)
    }

    /// Remove the segment file of `key`. Idempotent.
    pub fn unlink(&self, key: SegmentKey) -> ShmResult<()> {
        remove_if_exists(&self.path_for(key))
    }

    /// Process-local segment backed by an anonymous mapping.
    pub fn create_anonymous(
        key: SegmentKey,
        data_size: usize,
        magic: u32,
        version: u32,
    ) -> ShmResult<Segment> {
        validate_segment_size(data_size)?;
        let mut mmap = MmapMut::map_anon(mapping_size(data_size))?;
        write_header(&mut mmap, key, data_size, magic, version);
        Segment::from_mapping(key, None, None, mmap, data_size, true, false)
    }
}
