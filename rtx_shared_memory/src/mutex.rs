//! Segment mutex: one word in shared memory, try-lock with bounded spin.
//!
//! The word holds the pid of the holder, `0` when free. Callers never block
//! indefinitely: after the spin budget is used up the lock attempt fails with
//! [`ShmError::LockTimeout`]. A lock whose holder process no longer exists is
//! taken over.

use crate::error::{ShmError, ShmResult};
use crate::platform::{get_current_pid, is_process_alive};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// How long a lock attempt may spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinBudget {
    /// Number of attempts.
    pub attempts: u32,
    /// Whether the backoff may sleep. Realtime callers never sleep.
    pub allow_sleep: bool,
}

impl SpinBudget {
    /// Budget for realtime callers: short, never sleeps.
    pub const RT: SpinBudget = SpinBudget {
        attempts: 64,
        allow_sleep: false,
    };

    /// Budget for non-realtime callers: roughly one second.
    pub const USER: SpinBudget = SpinBudget {
        attempts: 1000,
        allow_sleep: true,
    };
}

/// Adaptive backoff: spin, pause, yield, then (if allowed) sleep 1ms.
#[inline]
fn backoff(k: u32, allow_sleep: bool) {
    if k < 4 {
        // busy spin
    } else if k < 16 {
        std::hint::spin_loop();
    } else if k < 32 || !allow_sleep {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Mutex word living in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    owner: AtomicU32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ShmMutex>(), 4);

impl ShmMutex {
    /// A free mutex.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
        }
    }

    /// Pid of the holder, if locked.
    pub fn holder(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Single lock attempt.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.owner
            .compare_exchange(0, get_current_pid(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { mutex: self })
    }

    /// Lock attempts with adaptive backoff, bounded by `budget`.
    ///
    /// `what` names the protected structure in the timeout error.
    pub fn lock(&self, budget: SpinBudget, what: &'static str) -> ShmResult<ShmMutexGuard<'_>> {
        for k in 0..budget.attempts {
            if let Some(guard) = self.try_lock() {
                return Ok(guard);
            }
            backoff(k, budget.allow_sleep);
        }

        let holder = self.owner.load(Ordering::Acquire);
        if holder != 0 && !is_process_alive(holder) {
            let me = get_current_pid();
            if self
                .owner
                .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                warn!("Took over {} lock from dead pid {}", what, holder);
                return Ok(ShmMutexGuard { mutex: self });
            }
        }
        Err(ShmError::LockTimeout {
            what,
            holder: self.owner.load(Ordering::Acquire),
        })
    }

    /// Release without a guard. Only for holders that leaked their guard.
    pub fn force_unlock(&self) {
        self.owner.store(0, Ordering::Release);
    }
}

/// Releases the mutex on drop.
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner.store(0, Ordering::Release);
    }
}
