use std::path::PathBuf;

use cloudtail_backend::BackendError;
use thiserror::Error;

/// Rejected user input, reported before any backend call is made
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "invalid value for --severity flag: {value:?} (valid values: DEFAULT, DEBUG, INFO, NOTICE, WARNING, ERROR, CRITICAL, ALERT, EMERGENCY)"
    )]
    InvalidSeverity { value: String },

    #[error(
        "invalid value for --since flag: {value:?} (valid values: 1h, 30m, 20s, 1h15m30s, etc.): {reason}"
    )]
    InvalidDuration { value: String, reason: String },

    #[error("the --since flag duration must be positive (got {value:?})")]
    NegativeDuration { value: String },

    #[error("invalid value for --since-time flag: {value:?} (must be RFC3339 format): {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("only one of --since or --since-time may be used")]
    ConflictingSince,
}

/// Failure writing to an output sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open output file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write log entry: {0}")]
    Write(#[from] std::io::Error),
}

/// Fatal tail loop failures
#[derive(Debug, Error)]
pub enum TailError {
    #[error("giving up after {attempts} failed fetch attempt(s)")]
    BackendUnavailable {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    BackendRejected(BackendError),

    #[error(transparent)]
    Write(#[from] SinkError),
}
