//! Error types for volume lifecycle operations.
//!
//! Components return [`VolumeError`] and keep its kind intact on the way up.
//! Only the boundary adapter narrows it to a wire [`Code`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`VolumeError`].
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Failures raised while publishing or unpublishing a volume.
#[derive(Error, Debug)]
pub enum VolumeError {
    /// The request is missing a required field.
    #[error("{0}")]
    InvalidArgument(String),

    /// An external command ran past its deadline and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout {
        /// Command line that was running.
        command: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// An external command failed to start or exited unsuccessfully.
    #[error("command `{command}` failed ({status}): {output}")]
    ProcessFailure {
        /// Command line that failed.
        command: String,
        /// Exit status, or the spawn error when the command never started.
        status: String,
        /// Combined stdout and stderr captured from the command.
        output: String,
    },

    /// Host filesystem or mount table failure.
    #[error("{0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mount or unmount system call failure.
    #[error("mount error: {0}")]
    Mount(#[from] nix::errno::Errno),
}

/// The internal error taxonomy, one level richer than the wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or incomplete request.
    InvalidArgument,
    /// External process exceeded its bound.
    Timeout,
    /// External tool ran and rejected the operation.
    ProcessFailure,
    /// Anything else.
    Internal,
}

impl VolumeError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VolumeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            VolumeError::Timeout { .. } => ErrorKind::Timeout,
            VolumeError::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            VolumeError::Internal(_) | VolumeError::Io(_) | VolumeError::Mount(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for [`VolumeError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        VolumeError::InvalidArgument(message.into())
    }

    /// Shorthand for [`VolumeError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        VolumeError::Internal(message.into())
    }
}

/// Error codes understood by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// The caller must fix the request.
    InvalidArgument,
    /// Everything else.
    Internal,
}

/// A failed boundary call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    /// Wire code.
    pub code: Code,
    /// Kind of the underlying failure before narrowing.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl From<VolumeError> for Status {
    fn from(err: VolumeError) -> Self {
        let kind = err.kind();
        let code = match kind {
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::Timeout | ErrorKind::ProcessFailure | ErrorKind::Internal => Code::Internal,
        };
        Status {
            code,
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_keeps_its_kind_but_narrows_to_internal() {
        let err = VolumeError::Timeout {
            command: "/bin/buildah delete v1".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let status = Status::from(err);
        assert_eq!(status.code, Code::Internal);
        assert_eq!(status.kind, ErrorKind::Timeout);
        assert!(status.message.contains("timed out"));
    }

    #[test]
    fn invalid_argument_stays_invalid_argument() {
        let status = Status::from(VolumeError::invalid_argument("Volume ID missing in request"));
        assert_eq!(status.code, Code::InvalidArgument);
        assert_eq!(status.message, "Volume ID missing in request");
    }

    #[test]
    fn host_errors_are_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: VolumeError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err: VolumeError = nix::errno::Errno::EBUSY.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(Status::from(err).code, Code::Internal);
    }
}
