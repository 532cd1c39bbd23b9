//! Request/response envelope between the scheduler and the worker runtime.
//!
//! The pool never executes submitted code itself. Each worker thread owns a
//! [`TaskRuntime`] that rehydrates the function payload and invokes it with
//! the supplied arguments; the scheduler only sees the envelope defined here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work as handed to a worker runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Textual function payload the runtime rehydrates into a callable.
    /// Travels under the wire name `fn`.
    #[serde(rename = "fn")]
    pub source: String,
    /// Ordered, transport-safe argument values.
    pub args: Vec<Value>,
}

/// Worker response: exactly one of a result value or an error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResponse {
    /// The submitted function returned a value.
    Result(Value),
    /// The submitted function threw, or the runtime could not run it.
    Error(ErrorPayload),
}

impl TaskResponse {
    /// Successful response carrying `value`.
    pub fn ok(value: Value) -> Self {
        Self::Result(value)
    }

    /// Error response with a kind and message and no trace.
    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        })
    }
}

/// Failure details captured by the runtime, reconstructed on the caller side
/// as [`PoolError::User`](crate::PoolError::User).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Original error kind (class or constructor name).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Call-site trace, when the runtime captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Executes one request and produces exactly one response.
///
/// Implementations run on dedicated worker threads. A panic inside
/// [`execute`](TaskRuntime::execute) is treated as a worker crash: the bound
/// job fails with [`PoolError::WorkerCrash`](crate::PoolError::WorkerCrash)
/// and the worker is replaced in place.
pub trait TaskRuntime: Send + Sync + 'static {
    /// Rehydrate `request.source`, invoke it with `request.args`, and return
    /// the outcome.
    fn execute(&self, request: &TaskRequest) -> TaskResponse;
}
