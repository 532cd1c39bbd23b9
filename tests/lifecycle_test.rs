//! Crash recovery, health-check eviction, autoscaling, metrics and
//! shutdown behaviour.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use isopool::{
    Pool, PoolConfig, PoolError, SubmitOptions, TaskRequest, TaskResponse, TaskRuntime,
};

const NO_ARGS: &[Value] = &[];

/// Runtime that can sleep, fail, panic, or stall exactly once.
#[derive(Clone, Default)]
struct FaultRuntime {
    stalled_once: Arc<AtomicBool>,
}

impl TaskRuntime for FaultRuntime {
    fn execute(&self, request: &TaskRequest) -> TaskResponse {
        match request.source.as_str() {
            "() => 42" => TaskResponse::ok(json!(42)),
            "(ms) => sleep(ms)" => {
                let ms = request.args[0].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                TaskResponse::ok(json!(ms))
            }
            "() => explode()" => panic!("simulated runtime crash"),
            "() => { throw new TypeError('boom') }" => TaskResponse::Error(isopool::ErrorPayload {
                kind: "TypeError".into(),
                message: "boom".into(),
                trace: Some("at <anonymous>:1:14".into()),
            }),
            "() => stallOnce()" => {
                if !self.stalled_once.swap(true, Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1_000));
                }
                TaskResponse::ok(json!("recovered"))
            }
            other => TaskResponse::err("ReferenceError", format!("unknown function: {other}")),
        }
    }
}

#[tokio::test]
async fn worker_crash_fails_the_job_and_preserves_pool_size() {
    let pool = Pool::new(PoolConfig::new().with_pool_size(2), FaultRuntime::default()).unwrap();
    let before = pool.size();

    let err = pool
        .submit(SubmitOptions::default(), "() => explode()", NO_ARGS)
        .await
        .unwrap_err();
    match err {
        PoolError::WorkerCrash(cause) => assert!(cause.contains("simulated"), "{cause}"),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(pool.size(), before);
    assert_eq!(pool.metrics().worker_restarts, 1);

    // The replacement keeps serving.
    let value = pool
        .submit(SubmitOptions::default(), "() => 42", NO_ARGS)
        .await
        .unwrap();
    assert_eq!(value, json!(42));
    pool.terminate();
}

#[tokio::test]
async fn user_errors_preserve_kind_message_and_trace() {
    let pool = Pool::new(PoolConfig::new().with_pool_size(1), FaultRuntime::default()).unwrap();
    let err = pool
        .submit(
            SubmitOptions::default(),
            "() => { throw new TypeError('boom') }",
            NO_ARGS,
        )
        .await
        .unwrap_err();
    match err {
        PoolError::User(payload) => {
            assert_eq!(payload.kind, "TypeError");
            assert_eq!(payload.message, "boom");
            assert!(payload.trace.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    // A user error does not cost the worker.
    let metrics = pool.metrics();
    assert_eq!(metrics.failed_jobs, 1);
    assert_eq!(metrics.worker_restarts, 0);
    pool.terminate();
}

#[tokio::test]
async fn close_drains_queued_and_in_flight_work() -> anyhow::Result<()> {
    let pool = Pool::new(PoolConfig::new().with_pool_size(2), FaultRuntime::default())?;

    let handles: Vec<_> = (0..5)
        .map(|_| pool.submit(SubmitOptions::default(), "(ms) => sleep(ms)", &[100u64]))
        .collect();

    pool.close().await;

    for handle in handles {
        assert_eq!(handle.await?, json!(100));
    }
    let metrics = pool.metrics();
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.active_jobs, 0);
    assert_eq!(metrics.completed_jobs, 5);

    // Submissions after close fail fast.
    let err = pool
        .submit(SubmitOptions::default(), "() => 42", NO_ARGS)
        .await
        .unwrap_err();
    assert_eq!(err, PoolError::Closing);
    Ok(())
}

#[tokio::test]
async fn close_on_an_idle_pool_returns_promptly() {
    let pool = Pool::new(PoolConfig::new().with_pool_size(2), FaultRuntime::default()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), pool.close())
        .await
        .expect("close did not return");
    assert_eq!(pool.metrics().worker_count, 0);
}

#[tokio::test]
async fn terminate_is_idempotent_and_fails_pending_handles() {
    let pool = Pool::new(PoolConfig::new().with_pool_size(1), FaultRuntime::default()).unwrap();

    let bound = pool.submit(SubmitOptions::default(), "(ms) => sleep(ms)", &[300u64]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let queued = pool.submit(SubmitOptions::default(), "() => 42", NO_ARGS);

    pool.terminate();
    pool.terminate();

    assert_eq!(bound.await, Err(PoolError::Closing));
    assert_eq!(queued.await, Err(PoolError::Closing));
    assert_eq!(pool.size(), 0);
}

#[tokio::test]
async fn health_check_evicts_a_stalled_worker_and_requeues_its_job() {
    let pool = Pool::new(
        PoolConfig::new()
            .with_pool_size(1)
            .with_health_check_interval(Duration::from_millis(50))
            .with_max_inactivity(Duration::from_millis(150)),
        FaultRuntime::default(),
    )
    .unwrap();

    // Stalls for a full second on its first run, then completes instantly on
    // the replacement worker after eviction.
    let value = pool
        .submit(SubmitOptions::default(), "() => stallOnce()", NO_ARGS)
        .await
        .unwrap();
    assert_eq!(value, json!("recovered"));
    assert!(pool.metrics().worker_restarts >= 1);
    pool.terminate();
}

#[tokio::test]
async fn autoscale_grows_the_pool_up_to_the_ceiling() {
    let pool = Pool::new(
        PoolConfig::new()
            .with_pool_size(1)
            .with_min_pool_size(1)
            .with_max_pool_size(3)
            .with_auto_scale(true)
            .with_scale_up_threshold(2),
        FaultRuntime::default(),
    )
    .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| pool.submit(SubmitOptions::default(), "(ms) => sleep(ms)", &[150u64]))
        .collect();

    assert_eq!(pool.size(), 3, "queue pressure should grow the pool");

    for handle in handles {
        handle.await.unwrap();
    }
    pool.terminate();
}

#[tokio::test]
async fn autoscale_retires_idle_workers_down_to_the_floor() {
    let pool = Pool::new(
        PoolConfig::new()
            .with_pool_size(1)
            .with_min_pool_size(1)
            .with_max_pool_size(3)
            .with_auto_scale(true)
            .with_scale_up_threshold(2)
            .with_scale_down_delay(Duration::from_millis(50))
            .with_health_check_interval(Duration::from_millis(50)),
        FaultRuntime::default(),
    )
    .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| pool.submit(SubmitOptions::default(), "(ms) => sleep(ms)", &[100u64]))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(pool.size() > 1);

    // One idle worker is retired per health tick once the delay elapses.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(pool.size(), 1);
    pool.terminate();
}

#[tokio::test]
async fn metrics_reset_zeroes_counters() {
    let pool = Pool::new(PoolConfig::new().with_pool_size(1), FaultRuntime::default()).unwrap();

    pool.submit(SubmitOptions::default(), "() => 42", NO_ARGS)
        .await
        .unwrap();
    pool.submit(SubmitOptions::default(), "(ms) => sleep(ms)", &[20u64])
        .await
        .unwrap();
    let err = pool
        .submit(
            SubmitOptions::default(),
            "() => { throw new TypeError('boom') }",
            NO_ARGS,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::User(_)));

    let metrics = pool.metrics();
    assert_eq!(metrics.completed_jobs, 2);
    assert_eq!(metrics.failed_jobs, 1);
    assert!(metrics.avg_execution >= Duration::from_millis(5));
    assert_eq!(metrics.worker_count, 1);

    pool.reset_metrics();
    let metrics = pool.metrics();
    assert_eq!(metrics.completed_jobs, 0);
    assert_eq!(metrics.failed_jobs, 0);
    assert_eq!(metrics.total_execution, Duration::ZERO);
    pool.terminate();
}
