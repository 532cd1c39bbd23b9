//! The pool scheduler: submission, dispatch, timeout and cancellation
//! coordination, worker supervision, autoscaling and shutdown.
//!
//! All scheduler state lives behind a single mutex; every transition locks
//! it, so no two transitions observe each other mid-update. Workers execute
//! on dedicated OS threads, while timers, cancellation listeners, the worker
//! event pump and the health check run as tokio tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::job::{AbortOnDrop, Job, JobHandle, JobId, Priority, SubmitOptions};
use crate::core::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::core::queue::PriorityQueue;
use crate::core::validate::InputValidator;
use crate::core::worker::{WorkerEvent, WorkerHandle, WorkerId};
use crate::protocol::{TaskRequest, TaskResponse, TaskRuntime};

/// Scheduler state; every transition happens under this one lock.
struct PoolState {
    workers: Vec<WorkerHandle>,
    queue: PriorityQueue,
    /// Jobs currently bound to a worker, keyed by worker id.
    bound: HashMap<WorkerId, Job>,
    closing: bool,
    /// Signalled once when the pool is closing and fully drained.
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl PoolState {
    fn drained(&self) -> bool {
        self.queue.is_empty() && self.bound.is_empty()
    }

    fn worker_index(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|worker| worker.id == id)
    }
}

struct Inner<R: TaskRuntime> {
    config: PoolConfig,
    runtime: Arc<R>,
    state: Mutex<PoolState>,
    metrics: MetricsRecorder,
    validator: InputValidator,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    weak: Weak<Inner<R>>,
    next_worker_id: AtomicU64,
    next_job_id: AtomicU64,
    terminated: AtomicBool,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Priority-aware thread pool executor.
///
/// Jobs are submitted as a function payload plus transport-safe arguments
/// and resolve through a [`JobHandle`]. Workers that crash, stall or blow a
/// timeout are replaced in place; the affected caller receives a typed
/// failure and the pool keeps serving.
///
/// # Example
///
/// ```rust,ignore
/// use isopool::{Pool, PoolConfig, SubmitOptions};
///
/// let pool = Pool::new(PoolConfig::new().with_pool_size(4), my_runtime)?;
/// let value = pool
///     .submit(SubmitOptions::default(), "(a, b) => a + b", &[2, 3])
///     .await?;
/// assert_eq!(value, serde_json::json!(5));
/// ```
pub struct Pool<R: TaskRuntime> {
    inner: Arc<Inner<R>>,
}

impl<R: TaskRuntime> Pool<R> {
    /// Create a pool and spawn its initial workers.
    ///
    /// Must be called from within a tokio runtime: timers, cancellation
    /// listeners and the event pump run as tokio tasks.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] when the configuration fails
    /// validation.
    pub fn new(config: PoolConfig, runtime: R) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak| Inner {
            validator: InputValidator::new(config.strict_mode),
            config,
            runtime: Arc::new(runtime),
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                queue: PriorityQueue::new(),
                bound: HashMap::new(),
                closing: false,
                shutdown_waiters: Vec::new(),
            }),
            metrics: MetricsRecorder::new(),
            event_tx,
            weak: weak.clone(),
            next_worker_id: AtomicU64::new(0),
            next_job_id: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            pump_task: Mutex::new(None),
            health_task: Mutex::new(None),
        });

        {
            let mut state = inner.state.lock();
            for _ in 0..inner.config.pool_size {
                let worker = inner.spawn_worker();
                state.workers.push(worker);
            }
        }

        *inner.pump_task.lock() = Some(tokio::spawn(event_pump(
            Arc::downgrade(&inner),
            event_rx,
        )));
        *inner.health_task.lock() = Some(tokio::spawn(health_loop(
            Arc::downgrade(&inner),
            inner.config.health_check_interval(),
        )));

        info!(
            pool_size = inner.config.pool_size,
            auto_scale = inner.config.auto_scale,
            strict_mode = inner.config.strict_mode,
            "pool initialized"
        );
        Ok(Self { inner })
    }

    /// Submit a function payload with arguments; per-job controls go in
    /// `options`.
    ///
    /// Always returns a handle. Rejections — a closing pool, a strict-mode
    /// validation failure, an already-triggered cancellation handle — are
    /// delivered through the handle, never as a synchronous panic.
    pub fn submit<A: Serialize>(
        &self,
        options: SubmitOptions,
        source: impl Into<String>,
        args: &[A],
    ) -> JobHandle {
        let inner = &self.inner;
        let (completion, handle) = JobHandle::channel();

        if inner.terminated.load(Ordering::Acquire) || inner.state.lock().closing {
            let _ = completion.send(Err(PoolError::Closing));
            return handle;
        }

        let source = source.into();
        if let Err(err) = inner.validator.check_function(&source) {
            let _ = completion.send(Err(err));
            return handle;
        }
        let mut encoded = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            match InputValidator::encode_arg(index, arg) {
                Ok(value) => encoded.push(value),
                Err(err) => {
                    let _ = completion.send(Err(err));
                    return handle;
                }
            }
        }
        if options
            .cancel
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
        {
            let _ = completion.send(Err(PoolError::Cancelled));
            return handle;
        }

        let id = inner.next_job_id.fetch_add(1, Ordering::Relaxed);
        let request = TaskRequest {
            source,
            args: encoded,
        };
        let mut job = Job::new(id, request, options, completion);

        // The listener lives until the job completes; completion aborts it.
        if let Some(token) = job.cancel.clone() {
            let weak = inner.weak.clone();
            let listener = tokio::spawn(async move {
                token.cancelled().await;
                if let Some(inner) = weak.upgrade() {
                    inner.handle_cancel(id);
                }
            });
            job.cancel_guard = Some(AbortOnDrop::new(listener));
        }

        let mut state = inner.state.lock();
        // Closing may have flipped between the early check and this lock.
        if state.closing {
            job.complete(Err(PoolError::Closing));
            return handle;
        }
        inner.dispatch(&mut state, job);
        handle
    }

    /// Current worker count.
    pub fn size(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        let state = self.inner.state.lock();
        self.inner
            .metrics
            .snapshot(state.bound.len(), state.queue.len(), state.workers.len())
    }

    /// Zero all counters and rebase the uptime clock.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Gracefully shut down: stop accepting submissions, let queued and
    /// in-flight jobs finish, then terminate the workers.
    ///
    /// The drain is event-driven: the completion path signals this call
    /// directly once nothing is queued or in flight.
    pub async fn close(&self) {
        let waiter = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            if state.drained() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.shutdown_waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(task) = self.inner.health_task.lock().take() {
            task.abort();
        }
        if let Some(rx) = waiter {
            debug!("close waiting for drain");
            let _ = rx.await;
        }
        self.inner.terminate();
        info!("pool closed");
    }

    /// Forcibly stop everything: terminate every worker, clear the queue and
    /// drop all bindings. Pending handles resolve with
    /// [`PoolError::Closing`]. Idempotent, and safe during or after
    /// [`close`](Pool::close).
    pub fn terminate(&self) {
        self.inner.terminate();
    }
}

impl<R: TaskRuntime> Drop for Pool<R> {
    fn drop(&mut self) {
        // No draining on drop; explicit close() is the graceful path.
        self.inner.terminate();
    }
}

impl<R: TaskRuntime> Inner<R> {
    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        WorkerHandle::spawn(
            id,
            Arc::clone(&self.runtime),
            self.event_tx.clone(),
            self.config.thread_stack_size,
        )
    }

    /// First worker that is healthy and has no bound job.
    fn idle_worker(state: &PoolState) -> Option<usize> {
        state
            .workers
            .iter()
            .position(|worker| worker.healthy && !state.bound.contains_key(&worker.id))
    }

    /// Hand the job to an idle worker, or queue it (possibly growing the
    /// pool).
    fn dispatch(&self, state: &mut PoolState, job: Job) {
        if let Some(idx) = Self::idle_worker(state) {
            if !self.start_job(state, idx, job) {
                self.pump(state);
            }
            return;
        }

        state.queue.enqueue(job);
        let depth = state.queue.len();
        if self.config.auto_scale
            && depth >= self.config.scale_up_threshold
            && state.workers.len() < self.config.max_pool_size
        {
            let worker = self.spawn_worker();
            debug!(
                worker = worker.id,
                depth,
                high = state.queue.depth_of(Priority::High),
                "queue depth crossed threshold, scaling up"
            );
            state.workers.push(worker);
            self.pump(state);
        }
    }

    /// Bind `job` to the worker at `idx` and send the request.
    ///
    /// Returns `false` when the worker's thread turned out to be gone; the
    /// job goes back to the front of its band and the worker is replaced, so
    /// the caller can pump again.
    fn start_job(&self, state: &mut PoolState, idx: usize, mut job: Job) -> bool {
        let worker_id = state.workers[idx].id;
        job.started_at = Some(Instant::now());

        if let Some(timeout) = job.timeout {
            let weak = self.weak.clone();
            let job_id = job.id;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.handle_timeout(job_id, timeout);
                }
            });
            job.timeout_guard = Some(AbortOnDrop::new(timer));
        }

        match state.workers[idx].send(job.request.clone()) {
            Ok(()) => {
                debug!(job = job.id, worker = worker_id, "job dispatched");
                state.bound.insert(worker_id, job);
                true
            }
            Err(_) => {
                warn!(worker = worker_id, "request channel closed, replacing worker");
                job.reset_for_requeue();
                state.queue.enqueue_front(job);
                self.restart_worker(state, idx);
                false
            }
        }
    }

    /// Move queued jobs onto idle healthy workers until one side runs dry.
    fn pump(&self, state: &mut PoolState) {
        while let Some(idx) = Self::idle_worker(state) {
            let Some(job) = state.queue.dequeue() else {
                break;
            };
            // A send failure replaced the worker and re-queued the job; the
            // next iteration retries on the fresh thread.
            self.start_job(state, idx, job);
        }
    }

    /// Replace the worker at `idx` with a fresh one, preserving pool size.
    fn restart_worker(&self, state: &mut PoolState, idx: usize) {
        let replacement = self.spawn_worker();
        info!(
            old = state.workers[idx].id,
            new = replacement.id,
            "restarting worker in place"
        );
        let mut old = std::mem::replace(&mut state.workers[idx], replacement);
        old.terminate();
        self.metrics.record_restart();
    }

    /// Pump the queue and, when closing, signal the drain waiters.
    fn after_unbind(&self, state: &mut PoolState) {
        self.pump(state);
        if state.closing && state.drained() {
            for waiter in state.shutdown_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_event(&self, event: WorkerEvent) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        match event {
            WorkerEvent::Completed { worker, response } => {
                self.handle_completed(worker, response);
            }
            WorkerEvent::Crashed { worker, cause } => self.handle_crashed(worker, cause),
            WorkerEvent::Exited { worker, code } => self.handle_exited(worker, code),
        }
    }

    fn handle_completed(&self, worker: WorkerId, response: TaskResponse) {
        let mut state = self.state.lock();
        let Some(idx) = state.worker_index(worker) else {
            debug!(worker, "response from replaced worker discarded");
            return;
        };
        let Some(mut job) = state.bound.remove(&worker) else {
            // Nothing bound (the job was evicted); just record the activity.
            state.workers[idx].touch();
            return;
        };

        let execution = job.started_at.map_or(Duration::ZERO, |at| at.elapsed());
        match response {
            TaskResponse::Result(value) => {
                debug!(job = job.id, worker, ?execution, "job completed");
                self.metrics.record_completion(execution);
                job.complete(Ok(value));
            }
            TaskResponse::Error(payload) => {
                debug!(job = job.id, worker, kind = %payload.kind, "job failed in user code");
                self.metrics.record_failure();
                job.complete(Err(PoolError::User(payload)));
            }
        }

        let handle = &mut state.workers[idx];
        handle.touch();
        handle.failure_count = 0;
        handle.idle_since = Some(Instant::now());

        self.after_unbind(&mut state);
    }

    fn handle_timeout(&self, job_id: JobId, timeout: Duration) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        let bound_worker = state
            .bound
            .iter()
            .find_map(|(worker, job)| (job.id == job_id).then_some(*worker));
        let Some(worker_id) = bound_worker else {
            // The completion beat the timer to the lock.
            return;
        };
        let Some(mut job) = state.bound.remove(&worker_id) else {
            return;
        };

        warn!(job = job_id, worker = worker_id, ?timeout, "job timed out, replacing worker");
        self.metrics.record_failure();
        job.complete(Err(PoolError::Timeout(timeout)));

        // The worker may be spinning in user code; it cannot be reclaimed.
        if let Some(idx) = state.worker_index(worker_id) {
            self.restart_worker(&mut state, idx);
        }
        self.after_unbind(&mut state);
    }

    fn handle_cancel(&self, job_id: JobId) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();

        if let Some(mut job) = state.queue.remove(job_id) {
            debug!(job = job_id, "cancelled while queued");
            self.metrics.record_failure();
            job.complete(Err(PoolError::Cancelled));
            self.after_unbind(&mut state);
            return;
        }

        let bound_worker = state
            .bound
            .iter()
            .find_map(|(worker, job)| (job.id == job_id).then_some(*worker));
        let Some(worker_id) = bound_worker else {
            // Already resolved; cancellation lost the race.
            return;
        };
        let Some(mut job) = state.bound.remove(&worker_id) else {
            return;
        };

        warn!(job = job_id, worker = worker_id, "cancelled in flight, replacing worker");
        self.metrics.record_failure();
        job.complete(Err(PoolError::Cancelled));

        if let Some(idx) = state.worker_index(worker_id) {
            self.restart_worker(&mut state, idx);
        }
        self.after_unbind(&mut state);
    }

    fn handle_crashed(&self, worker: WorkerId, cause: String) {
        let mut state = self.state.lock();
        let Some(idx) = state.worker_index(worker) else {
            debug!(worker, "crash report from replaced worker discarded");
            return;
        };
        error!(worker, cause = %cause, "worker crashed, restarting in place");
        self.fail_worker(&mut state, idx, cause);
    }

    fn handle_exited(&self, worker: WorkerId, code: i32) {
        let mut state = self.state.lock();
        if code == 0 || state.closing {
            return;
        }
        let Some(idx) = state.worker_index(worker) else {
            return;
        };
        warn!(worker, code, "worker exited unexpectedly, restarting in place");
        self.fail_worker(&mut state, idx, format!("worker exited with code {code}"));
    }

    /// Shared crash/abnormal-exit recovery: fail the bound job (if any),
    /// replace the worker, keep the pool moving.
    fn fail_worker(&self, state: &mut PoolState, idx: usize, cause: String) {
        let (worker_id, failures) = {
            let handle = &mut state.workers[idx];
            handle.failure_count += 1;
            handle.healthy = false;
            (handle.id, handle.failure_count)
        };
        debug!(worker = worker_id, failures, "worker marked unhealthy");
        if let Some(mut job) = state.bound.remove(&worker_id) {
            self.metrics.record_failure();
            job.complete(Err(PoolError::WorkerCrash(cause)));
        }
        self.restart_worker(state, idx);
        self.after_unbind(state);
    }

    /// Periodic supervision: evict stalled workers and retire idle ones.
    fn run_health_check(&self) {
        let mut state = self.state.lock();
        if state.closing {
            return;
        }

        let max_inactivity = self.config.max_inactivity();
        let stalled: Vec<usize> = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| {
                state.bound.contains_key(&worker.id)
                    && worker.last_heartbeat.elapsed() > max_inactivity
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in stalled {
            let worker_id = state.workers[idx].id;
            warn!(worker = worker_id, "worker stalled past inactivity ceiling, evicting");
            state.workers[idx].healthy = false;
            if let Some(mut job) = state.bound.remove(&worker_id) {
                // Front of the band: the evicted job keeps its position.
                job.reset_for_requeue();
                state.queue.enqueue_front(job);
            }
            self.restart_worker(&mut state, idx);
        }

        if self.config.auto_scale && state.workers.len() > self.config.min_pool_size {
            let delay = self.config.scale_down_delay();
            let retire = state.workers.iter().position(|worker| {
                !state.bound.contains_key(&worker.id)
                    && worker.idle_since.is_some_and(|since| since.elapsed() > delay)
            });
            if let Some(idx) = retire {
                let mut worker = state.workers.remove(idx);
                debug!(worker = worker.id, "retiring worker after sustained idleness");
                worker.terminate();
            }
        }

        self.pump(&mut state);
    }

    /// Forced stop shared by `terminate`, `close` and `Drop`.
    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }

        let mut state = self.state.lock();
        state.closing = true;
        for worker in &mut state.workers {
            worker.terminate();
        }
        state.workers.clear();
        // Dropped jobs close their completion sinks; pending handles
        // resolve with `Closing`.
        state.queue.clear();
        state.bound.clear();
        for waiter in state.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("pool terminated");
    }
}

/// Drains worker events into scheduler transitions. Exits when the pool is
/// gone or every event sender has been dropped.
async fn event_pump<R: TaskRuntime>(
    weak: Weak<Inner<R>>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
}

/// Ticks the health check at a fixed cadence until the pool is gone.
async fn health_loop<R: TaskRuntime>(weak: Weak<Inner<R>>, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.run_health_check();
    }
}
