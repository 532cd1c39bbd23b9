//! Sizing, autoscaling and supervision knobs for the pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default worker count: host parallelism.
fn default_pool_size() -> usize {
    num_cpus::get()
}

/// Default autoscale floor.
fn default_min_pool_size() -> usize {
    1
}

/// Default autoscale ceiling: twice the host parallelism.
fn default_max_pool_size() -> usize {
    num_cpus::get() * 2
}

/// Default queue depth that triggers a scale-up.
fn default_scale_up_threshold() -> usize {
    10
}

/// Default idle duration before a worker is retired: 30 seconds.
fn default_scale_down_delay_ms() -> u64 {
    30_000
}

/// Strict-mode validation is on unless explicitly disabled.
fn default_strict_mode() -> bool {
    true
}

/// Default health-check cadence: 5 seconds.
fn default_health_check_interval_ms() -> u64 {
    5_000
}

/// Default silence ceiling before a bound worker is considered stalled:
/// 60 seconds.
fn default_max_inactivity_ms() -> u64 {
    60_000
}

/// Default worker thread stack size: 2MB.
fn default_thread_stack_size() -> usize {
    2 * 1024 * 1024
}

/// Configuration for a [`Pool`](crate::Pool).
///
/// All fields are optional with sensible defaults, both through serde and the
/// `with_*` builder methods.
///
/// # Example
///
/// ```rust
/// use isopool::PoolConfig;
///
/// let config = PoolConfig::new()
///     .with_pool_size(4)
///     .with_auto_scale(true)
///     .with_max_pool_size(8)
///     .with_scale_up_threshold(16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Initial worker count.
    ///
    /// Default: host parallelism (`num_cpus::get()`).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Lower bound on the worker count; scale-down never goes below it.
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,

    /// Upper bound on the worker count; scale-up never exceeds it.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Enable on-enqueue scale-up and idle scale-down.
    #[serde(default)]
    pub auto_scale: bool,

    /// Queue depth at which an additional worker is spawned (when
    /// autoscaling is enabled).
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: usize,

    /// Continuous idleness after which a worker may be retired, in
    /// milliseconds (when autoscaling is enabled).
    #[serde(default = "default_scale_down_delay_ms")]
    pub scale_down_delay_ms: u64,

    /// Run the input validator on every submission.
    #[serde(default = "default_strict_mode")]
    pub strict_mode: bool,

    /// Cadence of the worker health check, in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// A bound worker silent for longer than this is evicted and replaced,
    /// in milliseconds.
    #[serde(default = "default_max_inactivity_ms")]
    pub max_inactivity_ms: u64,

    /// Stack size per worker thread, in bytes.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            auto_scale: false,
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_delay_ms: default_scale_down_delay_ms(),
            strict_mode: default_strict_mode(),
            health_check_interval_ms: default_health_check_interval_ms(),
            max_inactivity_ms: default_max_inactivity_ms(),
            thread_stack_size: default_thread_stack_size(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial worker count.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the autoscale floor.
    #[must_use]
    pub fn with_min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the autoscale ceiling.
    #[must_use]
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Enable or disable autoscaling.
    #[must_use]
    pub fn with_auto_scale(mut self, enabled: bool) -> Self {
        self.auto_scale = enabled;
        self
    }

    /// Set the queue depth that triggers a scale-up.
    #[must_use]
    pub fn with_scale_up_threshold(mut self, depth: usize) -> Self {
        self.scale_up_threshold = depth;
        self
    }

    /// Set the idle duration before a worker is retired.
    #[must_use]
    pub fn with_scale_down_delay(mut self, delay: Duration) -> Self {
        self.scale_down_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enable or disable strict-mode validation.
    #[must_use]
    pub fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Set the health-check cadence.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the silence ceiling for bound workers.
    #[must_use]
    pub fn with_max_inactivity(mut self, ceiling: Duration) -> Self {
        self.max_inactivity_ms = ceiling.as_millis() as u64;
        self
    }

    /// Set the stack size per worker thread.
    #[must_use]
    pub fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Idle duration before a worker is retired, as a `Duration`.
    #[must_use]
    pub fn scale_down_delay(&self) -> Duration {
        Duration::from_millis(self.scale_down_delay_ms)
    }

    /// Health-check cadence, as a `Duration`.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Silence ceiling for bound workers, as a `Duration`.
    #[must_use]
    pub fn max_inactivity(&self) -> Duration {
        Duration::from_millis(self.max_inactivity_ms)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".into());
        }
        if self.min_pool_size == 0 {
            return Err("min_pool_size must be greater than 0".into());
        }
        if self.min_pool_size > self.max_pool_size {
            return Err("min_pool_size must not exceed max_pool_size".into());
        }
        if self.pool_size < self.min_pool_size || self.pool_size > self.max_pool_size {
            return Err("pool_size must lie within [min_pool_size, max_pool_size]".into());
        }
        if self.scale_up_threshold == 0 {
            return Err("scale_up_threshold must be greater than 0".into());
        }
        if self.health_check_interval_ms == 0 {
            return Err("health_check_interval_ms must be greater than 0".into());
        }
        if self.max_inactivity_ms == 0 {
            return Err("max_inactivity_ms must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64KB".into());
        }
        Ok(())
    }
}
