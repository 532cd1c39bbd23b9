//! Worker threads: spawning, the request channel, liveness metadata and the
//! events reported back to the scheduler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::protocol::{TaskRequest, TaskResponse, TaskRuntime};

pub(crate) type WorkerId = u64;

/// Messages a worker thread reports back to the scheduler.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// The runtime produced a response for the in-flight request.
    Completed {
        worker: WorkerId,
        response: TaskResponse,
    },
    /// The runtime panicked; the worker thread is going down.
    Crashed { worker: WorkerId, cause: String },
    /// The worker thread finished; zero is an orderly exit.
    Exited { worker: WorkerId, code: i32 },
}

/// Scheduler-side handle to one worker thread.
///
/// Ids are generation-unique: a replacement worker never reuses its
/// predecessor's id, so events from a replaced thread are recognisable as
/// stale.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    request_tx: Option<Sender<TaskRequest>>,
    shutdown: Arc<AtomicBool>,
    /// Consecutive crashes; zeroed on every successful response.
    pub failure_count: u32,
    /// Updated on every send to and message from the worker.
    pub last_heartbeat: Instant,
    pub healthy: bool,
    /// Set while the worker has no bound job; drives scale-down.
    pub idle_since: Option<Instant>,
}

impl WorkerHandle {
    /// Spawn a worker thread bound to `runtime`, reporting on `events`.
    pub fn spawn<R: TaskRuntime>(
        id: WorkerId,
        runtime: Arc<R>,
        events: UnboundedSender<WorkerEvent>,
        stack_size: usize,
    ) -> Self {
        let (request_tx, request_rx) = bounded::<TaskRequest>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name(format!("isopool-worker-{id}"))
            .stack_size(stack_size)
            .spawn(move || worker_loop(id, runtime, request_rx, events, thread_shutdown))
            .expect("failed to spawn worker thread");
        Self {
            id,
            request_tx: Some(request_tx),
            shutdown,
            failure_count: 0,
            last_heartbeat: Instant::now(),
            healthy: true,
            idle_since: Some(Instant::now()),
        }
    }

    /// Hand a request to the worker thread.
    ///
    /// The channel holds one request and the scheduler only sends to workers
    /// without a bound job, so this does not block; failure means the thread
    /// is gone and the caller should replace the worker.
    pub fn send(&mut self, request: TaskRequest) -> Result<(), Box<TaskRequest>> {
        let Some(tx) = self.request_tx.as_ref() else {
            return Err(Box::new(request));
        };
        match tx.try_send(request) {
            Ok(()) => {
                self.last_heartbeat = Instant::now();
                self.idle_since = None;
                Ok(())
            }
            Err(TrySendError::Full(request) | TrySendError::Disconnected(request)) => {
                Err(Box::new(request))
            }
        }
    }

    /// Record activity observed from the worker.
    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Stop the worker: an idle thread sees its channel close and exits
    /// orderly; a thread stuck in user code is left behind to finish on its
    /// own, detached. Idempotent.
    pub fn terminate(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.request_tx = None;
        self.healthy = false;
    }
}

fn worker_loop<R: TaskRuntime>(
    id: WorkerId,
    runtime: Arc<R>,
    requests: Receiver<TaskRequest>,
    events: UnboundedSender<WorkerEvent>,
    shutdown: Arc<AtomicBool>,
) {
    debug!(worker = id, "worker thread started");
    let mut exit_code = 0;
    loop {
        let request = match requests.recv() {
            Ok(request) => request,
            // Channel closed: orderly shutdown.
            Err(_) => break,
        };
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| runtime.execute(&request))) {
            Ok(response) => {
                if events
                    .send(WorkerEvent::Completed {
                        worker: id,
                        response,
                    })
                    .is_err()
                {
                    // Scheduler is gone mid-job.
                    exit_code = 1;
                    break;
                }
            }
            Err(payload) => {
                let cause = panic_message(payload.as_ref());
                error!(worker = id, cause = %cause, "task runtime panicked");
                let _ = events.send(WorkerEvent::Crashed { worker: id, cause });
                break;
            }
        }
    }
    let _ = events.send(WorkerEvent::Exited {
        worker: id,
        code: exit_code,
    });
    debug!(worker = id, code = exit_code, "worker thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct EchoRuntime;

    impl TaskRuntime for EchoRuntime {
        fn execute(&self, request: &TaskRequest) -> TaskResponse {
            if request.source.contains("explode") {
                panic!("boom");
            }
            TaskResponse::ok(json!(request.args.clone()))
        }
    }

    fn request(source: &str) -> TaskRequest {
        TaskRequest {
            source: source.into(),
            args: vec![json!(1)],
        }
    }

    #[tokio::test]
    async fn completes_requests_and_exits_orderly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = WorkerHandle::spawn(7, Arc::new(EchoRuntime), tx, 256 * 1024);

        worker.send(request("(x) => x")).unwrap();
        match rx.recv().await.unwrap() {
            WorkerEvent::Completed { worker: id, response } => {
                assert_eq!(id, 7);
                assert_eq!(response, TaskResponse::ok(json!([1])));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        worker.terminate();
        match rx.recv().await.unwrap() {
            WorkerEvent::Exited { worker: id, code } => {
                assert_eq!(id, 7);
                assert_eq!(code, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_runtime_reports_a_crash() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = WorkerHandle::spawn(9, Arc::new(EchoRuntime), tx, 256 * 1024);

        worker.send(request("() => explode()")).unwrap();
        match rx.recv().await.unwrap() {
            WorkerEvent::Crashed { worker: id, cause } => {
                assert_eq!(id, 9);
                assert_eq!(cause, "boom");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        worker.terminate();
    }

    #[test]
    fn send_fails_once_terminated() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = WorkerHandle::spawn(3, Arc::new(EchoRuntime), tx, 256 * 1024);
        worker.terminate();
        assert!(worker.send(request("(x) => x")).is_err());
        std::thread::sleep(Duration::from_millis(10));
    }
}
