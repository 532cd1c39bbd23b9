//! Monotonic counters and snapshot-on-demand gauges observing the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Lock-free counters updated by the scheduler on every job transition.
/// Readers get a consistent view through [`MetricsRecorder::snapshot`];
/// concurrent updates may land in the next snapshot.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    completed_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    worker_restarts: AtomicU64,
    total_execution_micros: AtomicU64,
    started_at: Mutex<Instant>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            completed_jobs: AtomicU64::new(0),
            failed_jobs: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            total_execution_micros: AtomicU64::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }

    pub fn record_completion(&self, execution: Duration) {
        self.completed_jobs.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(execution.as_micros()).unwrap_or(u64::MAX);
        self.total_execution_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero all counters and rebase the uptime clock.
    pub fn reset(&self) {
        self.completed_jobs.store(0, Ordering::Relaxed);
        self.failed_jobs.store(0, Ordering::Relaxed);
        self.worker_restarts.store(0, Ordering::Relaxed);
        self.total_execution_micros.store(0, Ordering::Relaxed);
        *self.started_at.lock() = Instant::now();
    }

    /// Counters plus the live gauges supplied by the scheduler.
    pub fn snapshot(
        &self,
        active_jobs: usize,
        queue_depth: usize,
        worker_count: usize,
    ) -> MetricsSnapshot {
        let completed_jobs = self.completed_jobs.load(Ordering::Relaxed);
        let total_micros = self.total_execution_micros.load(Ordering::Relaxed);
        let avg_execution = if completed_jobs == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(total_micros / completed_jobs)
        };
        MetricsSnapshot {
            completed_jobs,
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            total_execution: Duration::from_micros(total_micros),
            avg_execution,
            active_jobs,
            queue_depth,
            worker_count,
            uptime: self.started_at.lock().elapsed(),
        }
    }
}

/// Point-in-time view of pool activity, returned by
/// [`Pool::metrics`](crate::Pool::metrics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Jobs that resolved with a value.
    pub completed_jobs: u64,
    /// Jobs that resolved with a failure after being accepted.
    pub failed_jobs: u64,
    /// Workers replaced after a crash, stall, timeout or cancellation kill.
    pub worker_restarts: u64,
    /// Summed execution time of completed jobs.
    pub total_execution: Duration,
    /// `total_execution / completed_jobs`, zero when nothing completed.
    pub avg_execution: Duration,
    /// Jobs currently bound to a worker.
    pub active_jobs: usize,
    /// Jobs waiting in the priority queue.
    pub queue_depth: usize,
    /// Current worker count.
    pub worker_count: usize,
    /// Time since pool construction or the last metrics reset.
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_without_completions() {
        let recorder = MetricsRecorder::new();
        recorder.record_failure();
        let snapshot = recorder.snapshot(0, 0, 4);
        assert_eq!(snapshot.avg_execution, Duration::ZERO);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.worker_count, 4);
    }

    #[test]
    fn average_derives_from_total() {
        let recorder = MetricsRecorder::new();
        recorder.record_completion(Duration::from_millis(10));
        recorder.record_completion(Duration::from_millis(30));
        let snapshot = recorder.snapshot(1, 2, 4);
        assert_eq!(snapshot.completed_jobs, 2);
        assert_eq!(snapshot.total_execution, Duration::from_millis(40));
        assert_eq!(snapshot.avg_execution, Duration::from_millis(20));
        assert_eq!(snapshot.active_jobs, 1);
        assert_eq!(snapshot.queue_depth, 2);
    }

    #[test]
    fn reset_zeroes_counters_and_rebases_uptime() {
        let recorder = MetricsRecorder::new();
        recorder.record_completion(Duration::from_millis(5));
        recorder.record_restart();
        std::thread::sleep(Duration::from_millis(5));
        recorder.reset();
        let snapshot = recorder.snapshot(0, 0, 1);
        assert_eq!(snapshot.completed_jobs, 0);
        assert_eq!(snapshot.worker_restarts, 0);
        assert!(snapshot.uptime < Duration::from_millis(5));
    }
}
