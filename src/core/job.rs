//! Job lifecycle types: priority bands, submission options, completion
//! handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::PoolError;
use crate::protocol::TaskRequest;

/// Queue band for a submitted job. Lower numeric value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Dequeued before all queued `Normal` and `Low` jobs.
    High = 0,
    /// The default band.
    Normal = 1,
    /// Dequeued only when no higher band has queued jobs.
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Per-job controls accepted at submission.
///
/// ```rust
/// use std::time::Duration;
/// use isopool::{Priority, SubmitOptions};
///
/// let options = SubmitOptions::new()
///     .with_timeout(Duration::from_secs(5))
///     .with_priority(Priority::High);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) priority: Priority,
}

impl SubmitOptions {
    /// Options with no timeout, no cancellation handle and normal priority.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the job with [`PoolError::Timeout`] if the worker has not
    /// responded within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail the job with [`PoolError::Cancelled`] when `token` is triggered.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Place the job in the given priority band.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

pub(crate) type JobId = u64;
pub(crate) type CompletionSender = oneshot::Sender<Result<Value, PoolError>>;

/// Aborts the wrapped task when dropped, so timeout timers and cancellation
/// listeners are disarmed on every path that lets go of a job.
pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One scheduled unit of work, owned by the scheduler from submission to
/// completion.
pub(crate) struct Job {
    pub id: JobId,
    pub request: TaskRequest,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    completion: Option<CompletionSender>,
    /// Stamped when the job is handed to a worker.
    pub started_at: Option<Instant>,
    /// Armed timeout timer, if the job carries a timeout and is in flight.
    pub timeout_guard: Option<AbortOnDrop>,
    /// Listener on the caller's cancellation handle.
    pub cancel_guard: Option<AbortOnDrop>,
}

impl Job {
    pub fn new(
        id: JobId,
        request: TaskRequest,
        options: SubmitOptions,
        completion: CompletionSender,
    ) -> Self {
        Self {
            id,
            request,
            priority: options.priority,
            timeout: options.timeout,
            cancel: options.cancel,
            completion: Some(completion),
            started_at: None,
            timeout_guard: None,
            cancel_guard: None,
        }
    }

    /// Resolve the job exactly once; later calls are no-ops. Disarms the
    /// timeout timer and deregisters the cancellation listener.
    pub fn complete(&mut self, outcome: Result<Value, PoolError>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have dropped its handle; that is not an error.
            let _ = tx.send(outcome);
        }
        self.timeout_guard = None;
        self.cancel_guard = None;
    }

    /// Strip runtime attributes before the job goes back into the queue, so
    /// the timer is re-armed on the next dispatch.
    pub fn reset_for_requeue(&mut self) {
        self.started_at = None;
        self.timeout_guard = None;
    }
}

/// The caller's read-only completion handle, returned by
/// [`Pool::submit`](crate::Pool::submit).
///
/// Completes exactly once with the job's result or one of the
/// [`PoolError`] failure kinds.
#[must_use = "a JobHandle does nothing until awaited"]
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Result<Value, PoolError>>,
}

impl JobHandle {
    /// A completion sink and the handle observing it.
    pub(crate) fn channel() -> (CompletionSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for JobHandle {
    type Output = Result<Value, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sink means the job was torn down with the pool.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(PoolError::Closing)))
    }
}
