use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit status used when a session ends without an exit-code frame.
pub const NO_EXIT_CODE: i32 = 1;

/// Exit status used when the local side is interrupted by a signal.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("instance failed to start ({kind}): {message}")]
    ProcessStart { kind: FailureKind, message: String },

    #[error("stream closed by peer")]
    StreamClosed,

    #[error("interrupted by signal")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl ControlError {
    pub(crate) fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        ControlError::Transport(format!("{}: {}", context, err))
    }

    /// Classification used when the error has to cross the fork boundary.
    pub fn kind(&self) -> FailureKind {
        match self {
            ControlError::Transport(_) => FailureKind::Transport,
            ControlError::Protocol(_) | ControlError::Json(_) => FailureKind::Protocol,
            ControlError::Remote(_) => FailureKind::Remote,
            ControlError::ProcessStart { kind, .. } => *kind,
            ControlError::StreamClosed => FailureKind::Transport,
            ControlError::Config(_) => FailureKind::Config,
            ControlError::Io(_) | ControlError::System(_) => FailureKind::Io,
            ControlError::Terminal(_) | ControlError::Interrupted => FailureKind::Internal,
        }
    }

    /// Process exit status a command-line caller should report.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControlError::Interrupted => INTERRUPTED_EXIT_CODE,
            _ => NO_EXIT_CODE,
        }
    }

    /// Configuration and application errors are reported as a single line;
    /// everything else deserves the full diagnostic detail in debug mode.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Config | FailureKind::Remote
        )
    }
}

/// Error classes preserved across the supervisor's fork/exec boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Config,
    Transport,
    Protocol,
    Remote,
    Io,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Config => write!(f, "config"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Protocol => write!(f, "protocol"),
            FailureKind::Remote => write!(f, "remote"),
            FailureKind::Io => write!(f, "io"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_process_start_wrapping() {
        let err = ControlError::ProcessStart {
            kind: FailureKind::Config,
            message: "kernel not found: 42".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Config);
        assert!(err.is_user_facing());
        assert_eq!(
            err.to_string(),
            "instance failed to start (config): kernel not found: 42"
        );
    }

    #[test]
    fn test_transport_is_not_user_facing() {
        let err = ControlError::transport("connect /tmp/x.ctrl", "connection refused");
        assert_eq!(err.kind(), FailureKind::Transport);
        assert!(!err.is_user_facing());
        assert_eq!(err.exit_code(), NO_EXIT_CODE);
        assert_eq!(ControlError::Interrupted.exit_code(), INTERRUPTED_EXIT_CODE);
    }
}
