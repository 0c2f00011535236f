//! Removal of per-instance files once their owning process exits.
//!
//! The owner usually replaces its image with the supervisor binary right
//! after registering, so no destructor of ours will ever run there. Instead a
//! small watcher process is forked which sleeps until the parent-death signal
//! arrives and then deletes the registered paths.

use crate::error::ControlError;
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{ForkResult, fork, getpid, getppid};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Fork a watcher that removes `paths` when the calling process exits.
///
/// Must be called while the process is single-threaded.
pub fn remove_on_exit(paths: &[&Path]) -> Result<(), ControlError> {
    let owner = getpid();
    let paths: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
    let devnull = File::options().read(true).write(true).open("/dev/null")?;

    let mut term = SigSet::empty();
    term.add(Signal::SIGTERM);

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            tracing::debug!(watcher = %child, paths = ?paths, "Registered exit cleanup");
            Ok(())
        }
        ForkResult::Child => {
            // Hold nothing open that the owner's peers might wait on.
            unsafe {
                for fd in 0..3 {
                    libc::dup2(devnull.as_raw_fd(), fd);
                }
                close_descriptors_from(3);
            }
            let _ = term.thread_block();
            let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGTERM);
            if getppid() == owner {
                let _ = term.wait();
            }
            for path in &paths {
                let _ = if path.is_dir() {
                    std::fs::remove_dir_all(path)
                } else {
                    std::fs::remove_file(path)
                };
            }
            unsafe { libc::_exit(0) }
        }
    }
}

/// Close every descriptor at or above `low`.
///
/// # Safety
/// Must only be called in a freshly forked child that owns nothing above `low`.
pub(crate) unsafe fn close_descriptors_from(low: RawFd) {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let max = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur.min(65536) as RawFd
    } else {
        1024
    };
    for fd in low..max {
        unsafe {
            libc::close(fd);
        }
    }
}
