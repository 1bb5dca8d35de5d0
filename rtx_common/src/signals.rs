//! Process signal handling shared by the message daemon and the module host.
//!
//! Termination signals (`SIGTERM`, `SIGINT`, `SIGQUIT`) only raise a flag that
//! the main loop polls. Crash signals (`SIGSEGV`, `SIGBUS`, `SIGILL`,
//! `SIGFPE`) write a fixed one-line diagnostic with `write(2)` and are re-raised
//! with the default action so a core dump is produced. The crash handler only
//! makes async-signal-safe calls. Crash signals are never treated as
//! recoverable.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Signals requesting a graceful shutdown.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// Signals that indicate a crash.
pub const CRASH_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
];

static TERMINATE: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_terminate(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
    TERMINATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_crash(sig: libc::c_int) {
    let mut buf = [0u8; 64];
    let len = crash_message(sig, &mut buf);
    // SAFETY: write(2) is async-signal-safe and buf is valid for len bytes.
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
    }

    // SA_RESETHAND restored the default disposition, so this dumps core.
    // SAFETY: raise is async-signal-safe.
    unsafe {
        libc::raise(sig);
    }
}

/// Fill `buf` with the crash diagnostic for `sig`. No allocation.
fn crash_message(sig: libc::c_int, buf: &mut [u8; 64]) -> usize {
    let prefix = b"rtx: fatal signal ";
    let mut len = prefix.len();
    buf[..len].copy_from_slice(prefix);
    len += format_decimal(sig as u32, &mut buf[len..]);
    let suffix = b", re-raising\n";
    buf[len..len + suffix.len()].copy_from_slice(suffix);
    len + suffix.len()
}

fn format_decimal(mut n: u32, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 10];
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for (i, d) in digits[..count].iter().rev().enumerate() {
        out[i] = *d;
    }
    count
}

/// Install the shutdown flag handler for [`TERMINATION_SIGNALS`].
pub fn install_termination_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in TERMINATION_SIGNALS {
        // SAFETY: the handler only stores to atomics.
        unsafe { sigaction(sig, &action)? };
    }
    Ok(())
}

/// Install the diagnostic handler for [`CRASH_SIGNALS`].
pub fn install_crash_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_crash),
        SaFlags::SA_RESETHAND | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    for sig in CRASH_SIGNALS {
        // SAFETY: the handler re-raises with the default disposition restored.
        unsafe { sigaction(sig, &action)? };
    }
    Ok(())
}

/// Whether a termination signal arrived (or shutdown was requested).
pub fn termination_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Request shutdown from inside the process.
pub fn request_termination() {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// The last termination signal received, if any.
pub fn last_signal() -> Option<Signal> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        n => Signal::try_from(n).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_formatting() {
        let mut buf = [0u8; 16];
        let n = format_decimal(11, &mut buf);
        assert_eq!(&buf[..n], b"11");
        let n = format_decimal(0, &mut buf);
        assert_eq!(&buf[..n], b"0");
    }

    #[test]
    fn crash_message_fits_any_signal_number() {
        let mut buf = [0u8; 64];
        let n = crash_message(libc::SIGSEGV, &mut buf);
        assert_eq!(&buf[..n], b"rtx: fatal signal 11, re-raising\n");
        let n = crash_message(libc::c_int::MAX, &mut buf);
        assert!(buf[..n].ends_with(b"2147483647, re-raising\n"));
    }

    #[test]
    fn crash_handlers_install() {
        install_crash_handlers().unwrap();
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: a null new action only queries the current one.
        let rc = unsafe { libc::sigaction(libc::SIGBUS, std::ptr::null(), &mut current) };
        assert_eq!(rc, 0);
        assert_eq!(current.sa_sigaction, on_crash as extern "C" fn(libc::c_int) as libc::sighandler_t);
        assert_ne!(current.sa_flags & libc::SA_RESETHAND, 0);
    }

    #[test]
    fn sigquit_sets_termination_flag() {
        install_termination_handlers().unwrap();
        nix::sys::signal::raise(Signal::SIGQUIT).unwrap();
        assert!(termination_requested());
        assert_eq!(last_signal(), Some(Signal::SIGQUIT));
    }
}
