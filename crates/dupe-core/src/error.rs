use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DupeError>;

/// Everything that can go wrong inside the core.
///
/// Each variant carries the structured fields a caller needs to diagnose the
/// failure without rerunning the command; `Display` is the human rendering.
#[derive(Debug, Error)]
pub enum DupeError {
    /// The process could not be started, or the elevation mechanism refused
    /// to run it (missing binary, exec error, authentication dismissed).
    #[error("failed to launch {program}: {message}")]
    CommandLaunch { program: String, message: String },

    /// The process ran and exited with a non-zero status.
    #[error("{program} failed with exit code {code}")]
    CommandExit { program: String, code: i32 },

    /// The process exceeded the configured per-step timeout and was killed.
    #[error("{program} timed out after {}s", after.as_secs())]
    Timeout { program: String, after: Duration },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The disk listing could not be decoded.
    #[error("failed to parse disk listing: {0}")]
    Parse(String),

    /// The request was rejected before anything was launched.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Exclusive mode is on and another operation is still running.
    #[error("another operation is already running")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DupeError {
    /// Exit code of the failed command, if the failure was a non-zero exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            DupeError::CommandExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the failure happened before the command produced an exit status.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, DupeError::CommandLaunch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_failure_display_includes_code() {
        let err = DupeError::CommandExit {
            program: "hdiutil".to_string(),
            code: 2,
        };
        assert_eq!(err.to_string(), "hdiutil failed with exit code 2");
        assert_eq!(err.exit_code(), Some(2));
        assert!(!err.is_launch_failure());
    }

    #[test]
    fn test_launch_failure_display_appends_platform_message() {
        let err = DupeError::CommandLaunch {
            program: "asr".to_string(),
            message: "No such file or directory (os error 2)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to launch asr: No such file or directory (os error 2)"
        );
        assert!(err.is_launch_failure());
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn test_timeout_display() {
        let err = DupeError::Timeout {
            program: "asr".to_string(),
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "asr timed out after 90s");
    }
}
