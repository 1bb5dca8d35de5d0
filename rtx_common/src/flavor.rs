//! Realtime scheduling backends ("flavors").
//!
//! A flavor is selected once, when the message daemon creates the session,
//! and is then passed explicitly to everything that creates tasks, reads time
//! or maps priorities. The set of backends is closed; each carries a static
//! [`FlavorDescriptor`].
//!
//! Priorities are backend specific: some backends treat larger numbers as
//! more urgent, others the inverse. Callers compare and step priorities only
//! through [`Flavor::prio_is_higher`], [`Flavor::prio_next_higher`] and
//! [`Flavor::prio_next_lower`].

pub mod task;

pub use task::{Task, TaskCycle, TaskSpec, TaskStats};

use bitflags::bitflags;
use std::path::Path;
use thiserror::Error;

bitflags! {
    /// Capability flags of a flavor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlavorFlags: u32 {
        /// Requires raw I/O privilege (iopl).
        const DOES_IO = 1 << 0;
        /// Runs as a loadable kernel module rather than a process.
        const KERNEL_BUILD = 1 << 1;
        /// Keeps scheduler bookkeeping in the shared segment.
        const DATA_IN_SHM = 1 << 2;
    }
}

/// Direction of a flavor's priority scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioPolicy {
    /// Larger numbers are more urgent (POSIX `SCHED_FIFO`).
    LargerIsHigher,
    /// Smaller numbers are more urgent (RTAI).
    SmallerIsHigher,
}

/// Static description of a flavor.
#[derive(Debug)]
pub struct FlavorDescriptor {
    /// Display name, also accepted on the command line.
    pub name: &'static str,
    /// One-letter mnemonic used in compact listings.
    pub mnemonic: char,
    /// Identifier stored in the session segment.
    pub id: u32,
    /// Capability flags.
    pub flags: FlavorFlags,
    /// Priority scale direction.
    pub policy: PrioPolicy,
    /// Most urgent priority.
    pub prio_highest: i32,
    /// Least urgent priority.
    pub prio_lowest: i32,
}

/// Errors raised by flavor selection and task primitives.
#[derive(Debug, Error)]
pub enum FlavorError {
    /// No flavor with this name.
    #[error("unknown flavor '{name}'")]
    Unknown {
        /// Requested name.
        name: String,
    },

    /// The requested flavor cannot run on the detected kernel.
    #[error("flavor '{flavor}' is incompatible with the running kernel ({detected})")]
    Incompatible {
        /// Requested flavor.
        flavor: &'static str,
        /// Kernel support that was detected.
        detected: &'static str,
    },

    /// Kernel-build flavors cannot host tasks in a userland process.
    #[error("flavor '{flavor}' runs tasks in kernel context, not in this process")]
    KernelBuild {
        /// Active flavor.
        flavor: &'static str,
    },

    /// Invalid task parameters or state.
    #[error("task '{task}': {reason}")]
    Task {
        /// Task name.
        task: String,
        /// What went wrong.
        reason: String,
    },

    /// Spawning the OS thread failed.
    #[error("failed to spawn task '{task}': {source}")]
    Spawn {
        /// Task name.
        task: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A realtime scheduling backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Flavor {
    /// Plain POSIX threads, no realtime guarantees.
    Posix = 1,
    /// PREEMPT_RT patched kernel, `SCHED_FIFO` threads.
    RtPreempt = 2,
    /// Xenomai co-kernel, userland threads.
    Xenomai = 3,
    /// Xenomai co-kernel, kernel modules.
    XenomaiKernel = 4,
    /// RTAI co-kernel, kernel modules.
    RtaiKernel = 5,
}

static DESCRIPTORS: [FlavorDescriptor; 5] = [
    FlavorDescriptor {
        name: "posix",
        mnemonic: 'p',
        id: 1,
        flags: FlavorFlags::empty(),
        policy: PrioPolicy::LargerIsHigher,
        prio_highest: 99,
        prio_lowest: 1,
    },
    FlavorDescriptor {
        name: "rt-preempt",
        mnemonic: 'r',
        id: 2,
        flags: FlavorFlags::DOES_IO,
        policy: PrioPolicy::LargerIsHigher,
        prio_highest: 99,
        prio_lowest: 1,
    },
    FlavorDescriptor {
        name: "xenomai",
        mnemonic: 'x',
        id: 3,
        flags: FlavorFlags::DOES_IO,
        policy: PrioPolicy::LargerIsHigher,
        prio_highest: 99,
        prio_lowest: 0,
    },
    FlavorDescriptor {
        name: "xenomai-kernel",
        mnemonic: 'k',
        id: 4,
        flags: FlavorFlags::DOES_IO
            .union(FlavorFlags::KERNEL_BUILD)
            .union(FlavorFlags::DATA_IN_SHM),
        policy: PrioPolicy::LargerIsHigher,
        prio_highest: 99,
        prio_lowest: 0,
    },
    FlavorDescriptor {
        name: "rtai-kernel",
        mnemonic: 'a',
        id: 5,
        flags: FlavorFlags::DOES_IO
            .union(FlavorFlags::KERNEL_BUILD)
            .union(FlavorFlags::DATA_IN_SHM),
        policy: PrioPolicy::SmallerIsHigher,
        prio_highest: 0,
        prio_lowest: 0x3FFF_FFFF,
    },
];

impl Flavor {
    /// Every flavor, in id order.
    pub const ALL: [Flavor; 5] = [
        Flavor::Posix,
        Flavor::RtPreempt,
        Flavor::Xenomai,
        Flavor::XenomaiKernel,
        Flavor::RtaiKernel,
    ];

    /// Static descriptor.
    pub fn descriptor(self) -> &'static FlavorDescriptor {
        &DESCRIPTORS[self as usize - 1]
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Identifier stored in the session segment.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Look up a flavor by its stored id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() == id)
    }

    /// Look up a flavor by name. Underscores are accepted for dashes.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Capability flags.
    pub fn flags(self) -> FlavorFlags {
        self.descriptor().flags
    }

    /// Whether the backend requires raw I/O privilege.
    pub fn does_io(self) -> bool {
        self.flags().contains(FlavorFlags::DOES_IO)
    }

    /// Whether tasks run in kernel context.
    pub fn is_kernel_build(self) -> bool {
        self.flags().contains(FlavorFlags::KERNEL_BUILD)
    }

    /// Whether scheduler bookkeeping lives in the shared segment.
    pub fn data_in_shm(self) -> bool {
        self.flags().contains(FlavorFlags::DATA_IN_SHM)
    }

    /// Whether the backend gives realtime guarantees.
    pub fn is_realtime(self) -> bool {
        self != Flavor::Posix
    }

    /// Whether hardening failures must abort startup.
    pub fn requires_hardening(self) -> bool {
        self.is_realtime()
    }

    /// Most urgent priority.
    pub fn prio_highest(self) -> i32 {
        self.descriptor().prio_highest
    }

    /// Least urgent priority.
    pub fn prio_lowest(self) -> i32 {
        self.descriptor().prio_lowest
    }

    /// Whether `a` is more urgent than `b`.
    pub fn prio_is_higher(self, a: i32, b: i32) -> bool {
        match self.descriptor().policy {
            PrioPolicy::LargerIsHigher => a > b,
            PrioPolicy::SmallerIsHigher => a < b,
        }
    }

    /// Clamp `prio` into the backend range.
    pub fn prio_clamp(self, prio: i32) -> i32 {
        let d = self.descriptor();
        let (lo, hi) = match d.policy {
            PrioPolicy::LargerIsHigher => (d.prio_lowest, d.prio_highest),
            PrioPolicy::SmallerIsHigher => (d.prio_highest, d.prio_lowest),
        };
        prio.clamp(lo, hi)
    }

    /// One step more urgent than `prio`, saturating at the highest priority.
    pub fn prio_next_higher(self, prio: i32) -> i32 {
        let prio = self.prio_clamp(prio);
        match self.descriptor().policy {
            PrioPolicy::LargerIsHigher => self.prio_clamp(prio.saturating_add(1)),
            PrioPolicy::SmallerIsHigher => self.prio_clamp(prio.saturating_sub(1)),
        }
    }

    /// One step less urgent than `prio`, saturating at the lowest priority.
    pub fn prio_next_lower(self, prio: i32) -> i32 {
        let prio = self.prio_clamp(prio);
        match self.descriptor().policy {
            PrioPolicy::LargerIsHigher => self.prio_clamp(prio.saturating_sub(1)),
            PrioPolicy::SmallerIsHigher => self.prio_clamp(prio.saturating_add(1)),
        }
    }

    /// Priority `steps` below the highest one.
    pub fn prio_below_highest(self, steps: u32) -> i32 {
        (0..steps).fold(self.prio_highest(), |p, _| self.prio_next_lower(p))
    }

    /// Monotonic time in nanoseconds.
    pub fn get_time(self) -> i64 {
        use nix::time::{ClockId, clock_gettime};
        clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map(|ts| ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64)
            .unwrap_or(0)
    }

    /// Whether this flavor can run on a kernel with the given markers.
    pub fn is_compatible(self, markers: &KernelMarkers) -> bool {
        match self {
            Flavor::Posix => true,
            Flavor::RtPreempt => markers.rt_preempt,
            Flavor::Xenomai | Flavor::XenomaiKernel => markers.xenomai,
            Flavor::RtaiKernel => markers.rtai,
        }
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Realtime support detected on the running kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelMarkers {
    /// `/proc/rtai` present.
    pub rtai: bool,
    /// `/proc/xenomai` present.
    pub xenomai: bool,
    /// `/sys/kernel/realtime` reads `1`.
    pub rt_preempt: bool,
}

impl KernelMarkers {
    /// Probe the running kernel.
    pub fn probe() -> Self {
        Self::probe_root(Path::new("/"))
    }

    /// Probe the marker files below `root`.
    pub fn probe_root(root: &Path) -> Self {
        let rt_preempt = std::fs::read_to_string(root.join("sys/kernel/realtime"))
            .map(|s| s.trim() == "1")
            .unwrap_or(false);
        Self {
            rtai: root.join("proc/rtai").exists(),
            xenomai: root.join("proc/xenomai").exists(),
            rt_preempt,
        }
    }

    /// Short description for diagnostics.
    pub fn describe(&self) -> &'static str {
        if self.rtai {
            "rtai"
        } else if self.xenomai {
            "xenomai"
        } else if self.rt_preempt {
            "rt-preempt"
        } else {
            "no realtime support"
        }
    }

    /// Flavor used when none is requested.
    pub fn default_flavor(&self) -> Flavor {
        if self.rtai {
            Flavor::RtaiKernel
        } else if self.xenomai {
            Flavor::Xenomai
        } else if self.rt_preempt {
            Flavor::RtPreempt
        } else {
            Flavor::Posix
        }
    }
}

/// Pick the session flavor.
///
/// An explicit request must name a known flavor that is compatible with
/// `markers`; there is no fallback. Without a request the detected default is
/// used.
pub fn select_flavor(
    requested: Option<&str>,
    markers: &KernelMarkers,
) -> Result<Flavor, FlavorError> {
    let Some(name) = requested else {
        return Ok(markers.default_flavor());
    };
    let flavor = Flavor::from_name(name).ok_or_else(|| FlavorError::Unknown {
        name: name.to_string(),
    })?;
    if !flavor.is_compatible(markers) {
        return Err(FlavorError::Incompatible {
            flavor: flavor.name(),
            detected: markers.describe(),
        });
    }
    Ok(flavor)
}
