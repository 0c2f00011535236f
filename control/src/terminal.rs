//! Local terminal handling for interactive run sessions.

use crate::error::ControlError;
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Raw mode is a process-wide resource; at most one guard exists at a time.
static RAW_MODE_HELD: AtomicBool = AtomicBool::new(false);

/// RAII guard for raw terminal mode.
/// Restores the original attributes on drop.
pub struct RawTerminal {
    fd: RawFd,
    original: Termios,
}

impl RawTerminal {
    /// Switch `fd` to raw mode and return a guard that restores it on drop.
    pub fn acquire(fd: BorrowedFd<'_>) -> Result<RawTerminal, ControlError> {
        if RAW_MODE_HELD.swap(true, Ordering::SeqCst) {
            return Err(ControlError::Terminal(
                "raw mode already held by another session".to_string(),
            ));
        }

        match Self::enter(fd) {
            Ok(original) => Ok(RawTerminal {
                fd: fd.as_raw_fd(),
                original,
            }),
            Err(e) => {
                RAW_MODE_HELD.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn enter(fd: BorrowedFd<'_>) -> Result<Termios, ControlError> {
        let original = tcgetattr(fd).map_err(|e| {
            ControlError::Terminal(format!("failed to get terminal attributes: {}", e))
        })?;

        let mut raw = original.clone();
        cfmakeraw(&mut raw);

        tcsetattr(fd, SetArg::TCSANOW, &raw)
            .map_err(|e| ControlError::Terminal(format!("failed to set raw mode: {}", e)))?;

        tracing::debug!(fd = fd.as_raw_fd(), "Terminal switched to raw mode");
        Ok(original)
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        if let Err(e) = tcsetattr(fd, SetArg::TCSADRAIN, &self.original) {
            tracing::warn!(error = %e, "Failed to restore terminal attributes");
        }
        RAW_MODE_HELD.store(false, Ordering::SeqCst);
    }
}

/// Check if the given descriptor is a TTY.
pub fn is_tty(fd: impl AsFd) -> bool {
    unsafe { libc::isatty(fd.as_fd().as_raw_fd()) == 1 }
}

/// Termination signals observed while a session is active.
///
/// The handlers only record the signal. They are installed without
/// `SA_RESTART` so that a blocking readiness wait returns `EINTR` and the
/// session can unwind through its guards.
pub mod signals {
    use crate::error::ControlError;
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    use std::sync::atomic::{AtomicI32, Ordering};

    const WATCHED: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

    static PENDING: AtomicI32 = AtomicI32::new(0);

    extern "C" fn record(signo: libc::c_int) {
        PENDING.store(signo, Ordering::SeqCst);
    }

    /// Take the most recent termination signal, if any.
    pub fn take_pending() -> Option<Signal> {
        match PENDING.swap(0, Ordering::SeqCst) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }

    /// Restores the previous dispositions on drop.
    pub struct TerminationGuard {
        previous: Vec<(Signal, SigAction)>,
    }

    impl TerminationGuard {
        pub fn install() -> Result<TerminationGuard, ControlError> {
            let action = SigAction::new(
                SigHandler::Handler(record),
                SaFlags::empty(),
                SigSet::empty(),
            );

            // Cleared first so a signal arriving mid-install is kept.
            PENDING.store(0, Ordering::SeqCst);
            let mut previous = Vec::with_capacity(WATCHED.len());
            for signal in WATCHED {
                let old = unsafe { sigaction(signal, &action) }?;
                previous.push((signal, old));
            }

            Ok(TerminationGuard { previous })
        }
    }

    impl Drop for TerminationGuard {
        fn drop(&mut self) {
            for (signal, old) in self.previous.drain(..) {
                unsafe {
                    let _ = sigaction(signal, &old);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{exclusive, same, snapshot};
    use super::*;
    use nix::pty::{Winsize, openpty};
    use nix::sys::signal::{Signal, raise};
    use nix::sys::termios::LocalFlags;

    #[test]
    fn test_pending_signal_recorded_while_guard_installed() {
        let _lock = exclusive();
        let guard = signals::TerminationGuard::install().unwrap();
        assert_eq!(signals::take_pending(), None);

        raise(Signal::SIGHUP).unwrap();
        assert_eq!(signals::take_pending(), Some(Signal::SIGHUP));
        assert_eq!(signals::take_pending(), None);
        drop(guard);
    }

    #[test]
    fn test_raw_mode_is_scoped_and_exclusive() {
        let _lock = exclusive();
        let pty = openpty(None::<&Winsize>, None::<&Termios>).unwrap();
        let fd = pty.slave.as_fd();
        let before = snapshot(fd);
        assert!(before.local_flags.contains(LocalFlags::ICANON));

        {
            let _guard = RawTerminal::acquire(fd).unwrap();
            let during = snapshot(fd);
            assert!(!during.local_flags.contains(LocalFlags::ICANON));
            assert!(!during.local_flags.contains(LocalFlags::ECHO));

            let second = RawTerminal::acquire(fd);
            assert!(matches!(second, Err(ControlError::Terminal(_))));
        }

        let after = snapshot(fd);
        assert!(same(&before, &after));

        // Released, so a new session may take it again.
        let guard = RawTerminal::acquire(fd).unwrap();
        drop(guard);
        assert!(same(&before, &snapshot(fd)));
    }

    #[test]
    fn test_is_tty() {
        let pty = openpty(None::<&Winsize>, None::<&Termios>).unwrap();
        assert!(is_tty(&pty.slave));

        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(!is_tty(&a));
    }
}
