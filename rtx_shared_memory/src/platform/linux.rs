//! Linux-specific shared memory and process hardening operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Create a new segment file at `path` and map it.
///
/// The file must not exist yet. Pages are populated up front so the first
/// realtime access does not fault.
pub fn create_segment_mmap(path: &Path, size: usize) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o660)
        .open(path)?;

    file.set_len(size as u64)?;

    // SAFETY: the file was just created with the requested length; the mapping
    // is only ever accessed through the segment types in this crate.
    let mmap = unsafe { MmapOptions::new().len(size).populate().map_mut(&file)? };
    Ok((file, mmap))
}

/// Attach to an existing segment file.
pub fn attach_segment_mmap(path: &Path) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ShmError::NotFound {
                name: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ShmError::PermissionDenied {
                name: path.display().to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    // SAFETY: see create_segment_mmap.
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok((file, mmap))
}

/// Try to take an exclusive `flock` on `file` without blocking.
///
/// Returns `Ok(false)` if another open file description holds the lock.
pub fn try_lock_exclusive(file: &File) -> ShmResult<bool> {
    // SAFETY: the descriptor is owned by `file` and valid for this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    // Use a null signal (None) to test for process existence without sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Lock all current and future pages of the process in memory.
pub fn lock_all_memory() -> ShmResult<()> {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)?;
    Ok(())
}

/// Touch `bytes` of freshly allocated memory, one write per page.
///
/// With memory locked, the touched pages stay resident and later
/// allocations of that size are served without page faults.
pub fn prefault(bytes: usize) -> usize {
    let page = page_size();
    let mut buf = vec![0u8; bytes];
    let mut touched = 0;
    for i in (0..buf.len()).step_by(page) {
        // SAFETY: i is in bounds; the volatile write keeps the loop from being elided.
        unsafe { std::ptr::write_volatile(buf.as_mut_ptr().add(i), 1) };
        touched += 1;
    }
    std::hint::black_box(&buf);
    touched
}

/// Acquire raw I/O port privilege.
#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub fn acquire_io_privilege() -> ShmResult<()> {
    // SAFETY: iopl only changes the privilege level of the calling process.
    let rc = unsafe { libc::iopl(3) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

/// Acquire raw I/O port privilege.
#[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
pub fn acquire_io_privilege() -> ShmResult<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported).into())
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let (_file, mmap) = create_segment_mmap(&path, 4096).unwrap();
        assert_eq!(mmap.len(), 4096);
        assert!(create_segment_mmap(&path, 4096).is_err());
    }

    #[test]
    fn flock_conflicts_between_descriptions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg");
        let (owner, _mmap) = create_segment_mmap(&path, 4096).unwrap();
        assert!(try_lock_exclusive(&owner).unwrap());

        let (probe, _) = attach_segment_mmap(&path).unwrap();
        assert!(!try_lock_exclusive(&probe).unwrap());

        drop(owner);
        assert!(try_lock_exclusive(&probe).unwrap());
    }

    #[test]
    fn attach_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            attach_segment_mmap(&dir.path().join("none")),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn prefault_touches_every_page() {
        let page = page_size();
        assert_eq!(prefault(page * 4), 4);
        assert_eq!(prefault(0), 0);
    }
}
