//! Launching the supervisor process.
//!
//! The launcher forks, and the child does all setup that can fail (argument
//! construction, binding the control endpoint, registration) before it
//! replaces its image with the supervisor binary. The parent blocks on a
//! close-on-exec pipe: end of file means the exec happened, anything else is
//! a [`FailureRecord`] describing why the child gave up.

use crate::config::ControlConfig;
use crate::endpoint::{self, Listener};
use crate::error::{ControlError, FailureKind};
use crate::registry::{InstanceMetadata, InstanceRegistry};
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, dup2, execv, fork, getpid, pipe2, setsid};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};

/// Everything needed to exec the supervisor for one instance.
#[derive(Debug, Default)]
pub struct Launch {
    pub args: Vec<String>,
    pub metadata: InstanceMetadata,
    /// Descriptors named in `args`; held open until the image is replaced.
    pub inherited: Vec<OwnedFd>,
}

/// Produces the supervisor's arguments. Runs inside the forked child, so it
/// may open descriptors that the supervisor inherits.
pub trait ArgsBuilder {
    fn build(&mut self, pid: i32) -> Result<Launch, ControlError>;
}

impl<F> ArgsBuilder for F
where
    F: FnMut(i32) -> Result<Launch, ControlError>,
{
    fn build(&mut self, pid: i32) -> Result<Launch, ControlError> {
        self(pid)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Fork and detach; otherwise the calling process becomes the supervisor.
    pub detach: bool,
    /// Terminate the supervisor when the launching process exits.
    pub exit_with_caller: bool,
}

pub const FAILURE_RECORD_VERSION: u32 = 1;

/// A child-side failure as it travels over the notification pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub version: u32,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl FailureRecord {
    pub fn from_error(err: &ControlError) -> Self {
        let message = match err {
            ControlError::ProcessStart { message, .. } => message.clone(),
            ControlError::Config(message)
            | ControlError::Transport(message)
            | ControlError::Protocol(message)
            | ControlError::Remote(message) => message.clone(),
            other => other.to_string(),
        };
        Self {
            version: FAILURE_RECORD_VERSION,
            kind: err.kind(),
            message,
            detail: BTreeMap::new(),
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let what = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self {
            version: FAILURE_RECORD_VERSION,
            kind: FailureKind::Internal,
            message: format!("launcher panicked: {}", what),
            detail: BTreeMap::new(),
        }
    }

    pub fn into_error(self) -> ControlError {
        ControlError::ProcessStart {
            kind: self.kind,
            message: self.message,
        }
    }

    /// Decode whatever the child wrote. Garbage is itself reported as a
    /// failure rather than mistaken for success.
    fn decode(bytes: &[u8]) -> FailureRecord {
        match serde_json::from_slice::<FailureRecord>(bytes) {
            Ok(record) if record.version == FAILURE_RECORD_VERSION => record,
            Ok(record) => FailureRecord {
                version: FAILURE_RECORD_VERSION,
                kind: FailureKind::Internal,
                message: format!("unsupported failure record version {}", record.version),
                detail: BTreeMap::new(),
            },
            Err(e) => FailureRecord {
                version: FAILURE_RECORD_VERSION,
                kind: FailureKind::Internal,
                message: format!("unreadable failure record: {}", e),
                detail: BTreeMap::from([(
                    "raw".to_string(),
                    String::from_utf8_lossy(bytes).into_owned(),
                )]),
            },
        }
    }
}

/// Start a supervisor for the instance described by `builder`.
///
/// Returns the supervisor's pid once its image has been replaced. Any failure
/// before that point comes back as [`ControlError::ProcessStart`] with the
/// classification observed in the child, and leaves neither a running child,
/// a socket file, nor a registry entry behind.
pub fn spawn(
    config: &ControlConfig,
    registry: &dyn InstanceRegistry,
    builder: &mut dyn ArgsBuilder,
    options: SpawnOptions,
) -> Result<Pid, ControlError> {
    if !options.detach {
        let err = match launch(config, registry, builder, options) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        return Err(err);
    }

    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut notice = Vec::new();
            File::from(read_end).read_to_end(&mut notice)?;

            if notice.is_empty() {
                tracing::debug!(pid = %child, "Supervisor started");
                return Ok(child);
            }

            let record = FailureRecord::decode(&notice);
            if let Err(e) = waitpid(child, None) {
                tracing::warn!(pid = %child, error = %e, "Failed to reap launcher child");
            }
            tracing::debug!(pid = %child, kind = %record.kind, message = %record.message, "Supervisor failed to start");
            Err(record.into_error())
        }
        ForkResult::Child => {
            drop(read_end);
            // A panic must be reported too; unwinding out of here would close
            // the pipe empty and look like a successful exec.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                launch(config, registry, builder, options)
            }));
            let record = match outcome {
                Ok(Ok(never)) => match never {},
                Ok(Err(err)) => FailureRecord::from_error(&err),
                Err(payload) => FailureRecord::from_panic(payload.as_ref()),
            };
            let mut pipe = File::from(write_end);
            if let Ok(bytes) = serde_json::to_vec(&record) {
                let _ = pipe.write_all(&bytes);
            }
            drop(pipe);
            unsafe { libc::_exit(1) }
        }
    }
}

/// The child's half of [`spawn`]: only returns on failure, after undoing
/// whatever it had set up.
fn launch(
    config: &ControlConfig,
    registry: &dyn InstanceRegistry,
    builder: &mut dyn ArgsBuilder,
    options: SpawnOptions,
) -> Result<Infallible, ControlError> {
    if options.detach {
        setsid()?;
    }
    if options.exit_with_caller {
        nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;
    }

    let pid = getpid().as_raw();
    let launch = builder.build(pid)?;

    let listener = endpoint::bind(&config.control_path(pid))?;
    registry.add(pid, &launch.metadata)?;

    let result = exec_supervisor(config, registry, &listener, launch.args, pid, options.detach);
    if let Err(e) = registry.remove(pid) {
        tracing::warn!(pid, error = %e, "Failed to remove instance entry");
    }
    drop(listener);
    drop(launch.inherited);
    result
}

fn exec_supervisor(
    config: &ControlConfig,
    registry: &dyn InstanceRegistry,
    listener: &Listener,
    extra: Vec<String>,
    pid: i32,
    detach: bool,
) -> Result<Infallible, ControlError> {
    let mut args = vec!["novmm".to_string()];
    args.extend(extra);
    args.push(format!("-controlfd={}", listener.as_raw_fd()));
    if detach {
        args.push(format!("-logfile={}", config.log_path(pid).display()));
    }

    let binary = CString::new(config.vmm_binary.as_os_str().as_bytes())
        .map_err(|e| ControlError::Config(format!("invalid supervisor path: {}", e)))?;
    let argv = args
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ControlError::Config(format!("invalid supervisor argument: {}", e)))?;

    listener.unlink_on_exit()?;
    registry.remove_on_exit(pid)?;

    if detach {
        let devnull = File::options().read(true).write(true).open("/dev/null")?;
        for fd in 0..3 {
            dup2(devnull.as_raw_fd(), fd)?;
        }
    }

    tracing::debug!(binary = %config.vmm_binary.display(), args = ?args, "Executing supervisor");
    execv(&binary, &argv).map_err(|e| {
        ControlError::Io(std::io::Error::new(
            std::io::Error::from(e).kind(),
            format!("exec {}: {}", config.vmm_binary.display(), e),
        ))
    })
}
