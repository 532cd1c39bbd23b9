//! Error types surfaced through job handles and at pool construction.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorPayload;

/// Errors produced by the pool. Every variant except `InvalidConfig` is
/// delivered through the submitting caller's [`JobHandle`](crate::JobHandle);
/// the pool never throws asynchronously at an unrelated observer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Strict-mode validation rejected the submission.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The pool is closing; no further submissions are accepted.
    #[error("pool is closing")]
    Closing,
    /// The job's timeout elapsed before the worker responded.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's cancellation handle fired before completion.
    #[error("job cancelled")]
    Cancelled,
    /// The worker executing the job crashed or exited abnormally.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),
    /// The submitted function failed; original kind, message and trace are
    /// preserved from the worker's error payload.
    #[error("{}: {}", .0.kind, .0.message)]
    User(ErrorPayload),
    /// Pool construction rejected the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
