//! One-time process hardening at host startup.

use crate::error::{HostError, HostResult};
use rtx_common::config::HostConfig;
use rtx_common::flavor::Flavor;
use rtx_shared_memory::ShmError;
use rtx_shared_memory::platform::{acquire_io_privilege, lock_all_memory, prefault};
use tracing::{info, warn};

/// What hardening achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardeningReport {
    /// Pages are locked in memory.
    pub memory_locked: bool,
    /// Pages touched by the prefault pass.
    pub pages_prefaulted: usize,
    /// Raw I/O privilege acquired.
    pub io_privilege: bool,
    /// Steps that failed without aborting.
    pub warnings: Vec<String>,
}

/// Lock memory, prefault the scratch buffer and acquire I/O privilege.
///
/// A failing step aborts when `flavor` requires hardening and is a warning
/// otherwise.
pub fn harden(config: &HostConfig, flavor: Flavor) -> HostResult<HardeningReport> {
    let mut report = HardeningReport::default();
    let strict = flavor.requires_hardening();

    if config.lock_memory {
        match lock_all_memory() {
            Ok(()) => report.memory_locked = true,
            Err(e) => step_failed(&mut report, strict, "mlockall", e)?,
        }
    }
    if config.prefault_bytes > 0 {
        report.pages_prefaulted = prefault(config.prefault_bytes);
    }
    if flavor.does_io() {
        match acquire_io_privilege() {
            Ok(()) => report.io_privilege = true,
            Err(e) => step_failed(&mut report, strict, "iopl", e)?,
        }
    }

    info!(
        "Hardening on {}: memory locked {}, {} pages prefaulted, io privilege {}",
        flavor, report.memory_locked, report.pages_prefaulted, report.io_privilege
    );
    Ok(report)
}

fn step_failed(
    report: &mut HardeningReport,
    strict: bool,
    step: &'static str,
    source: ShmError,
) -> HostResult<()> {
    if strict {
        return Err(HostError::Hardening { step, source });
    }
    warn!("Hardening step {} failed: {}", step, source);
    report.warnings.push(format!("{step}: {source}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_never_fails() {
        let config = HostConfig {
            prefault_bytes: 64 * 1024,
            ..HostConfig::default()
        };
        let report = harden(&config, Flavor::Posix).unwrap();
        assert!(report.pages_prefaulted > 0);
        assert!(!report.io_privilege);
        assert_eq!(report.memory_locked, report.warnings.is_empty());
    }

    #[test]
    fn disabled_steps_are_skipped() {
        let config = HostConfig {
            lock_memory: false,
            prefault_bytes: 0,
            ..HostConfig::default()
        };
        let report = harden(&config, Flavor::Posix).unwrap();
        assert_eq!(report, HardeningReport::default());
    }
}
