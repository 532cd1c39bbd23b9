//! Core scheduling components: jobs, the priority queue, validation,
//! metrics, workers and the pool itself.

pub mod error;
pub mod job;
pub mod metrics;
pub mod pool;
pub(crate) mod queue;
pub(crate) mod validate;
pub(crate) mod worker;

pub use error::PoolError;
pub use job::{JobHandle, Priority, SubmitOptions};
pub use metrics::MetricsSnapshot;
pub use pool::Pool;
