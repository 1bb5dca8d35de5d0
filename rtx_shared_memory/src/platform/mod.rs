//! Platform specific helpers.

pub mod linux;

pub use linux::{
    acquire_io_privilege, attach_segment_mmap, create_segment_mmap, get_current_pid,
    is_process_alive, lock_all_memory, prefault, try_lock_exclusive,
};
