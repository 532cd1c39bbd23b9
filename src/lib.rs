//! # isopool
//!
//! A priority-aware thread pool executor. Callers submit a function payload
//! plus transport-safe arguments together with optional per-job controls
//! (priority band, timeout, external cancellation) and receive a
//! [`JobHandle`] that resolves with the result or a typed [`PoolError`].
//!
//! The pool owns a bounded set of worker threads, each wrapping a
//! [`TaskRuntime`](protocol::TaskRuntime) that rehydrates and executes the
//! submitted computation in isolation. The scheduler supervises them:
//! crashed, stalled or timed-out workers are replaced in place, queued work
//! is dispatched strictly by priority band (FIFO within a band), and an
//! optional autoscaler grows and shrinks the pool between configured
//! bounds. [`Pool::metrics`] observes every transition.
//!
//! ## Shutdown
//!
//! [`Pool::close`] drains queued and in-flight work before terminating the
//! workers; the drain is event-driven, signalled directly by the completion
//! path. [`Pool::terminate`] stops everything immediately and is idempotent.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod protocol;
pub mod util;

pub use crate::config::PoolConfig;
pub use crate::core::{JobHandle, MetricsSnapshot, Pool, PoolError, Priority, SubmitOptions};
pub use crate::protocol::{ErrorPayload, TaskRequest, TaskResponse, TaskRuntime};
