mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use common::{Trace, eventually, failing, fast_config, single_worker_config, sleeping, started};
use rstest::rstest;
use serde_json::json;
use spindle_core::{
    AdmissionPolicy, Engine, EngineError, LaneCapacities, Payload, PayloadError, Priority,
    RetryPolicy, ShutdownOptions, SubmissionError, SubmitOptions, TaskError, TaskState, WaitError,
    WorkerBounds,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_task_overtakes_queued_low_tasks() {
    let engine = started(single_worker_config());
    let trace = Trace::new();
    engine.pause();

    let mut handles = Vec::new();
    for i in 0..10 {
        let opts = SubmitOptions::new().priority(Priority::Low);
        handles.push(engine.submit(trace.step(format!("low-{i}")), opts).await.unwrap());
    }
    let opts = SubmitOptions::new().priority(Priority::Critical);
    handles.push(engine.submit(trace.step("critical"), opts).await.unwrap());

    engine.resume();
    for handle in &handles {
        handle.wait(WAIT).await.unwrap();
    }

    let entries = trace.entries();
    assert_eq!(entries.len(), 11);
    assert_eq!(entries[0], "critical");
    let lows: Vec<String> = (0..10).map(|i| format!("low-{i}")).collect();
    assert_eq!(&entries[1..], lows.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_priority_runs_in_submission_order() {
    let engine = started(single_worker_config());
    let trace = Trace::new();
    engine.pause();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(
            engine
                .submit(trace.step(i.to_string()), SubmitOptions::new())
                .await
                .unwrap(),
        );
    }
    engine.resume();
    for handle in &handles {
        handle.wait(WAIT).await.unwrap();
    }

    assert_eq!(trace.entries(), vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_task_is_retried_then_exhausted() {
    let engine = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let payload = Payload::inline(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(PayloadError::failed("always broken"))
    });

    let handle = engine.submit(payload, SubmitOptions::new()).await.unwrap();
    let err = handle.wait(WAIT).await.unwrap_err();

    match err {
        WaitError::Task(TaskError::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 4);
            assert_eq!(
                *last,
                TaskError::Execution(PayloadError::failed("always broken"))
            );
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(handle.state(), TaskState::Failed);
    assert_eq!(handle.attempt(), 3);
    assert_eq!(handle.snapshot().history.len(), 4);

    let stats = engine.get_stats();
    assert_eq!(stats.tasks.retried, 3);
    assert_eq!(stats.tasks.processed, 4);
    assert_eq!(stats.tasks.failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flaky_task_succeeds_on_a_later_attempt() {
    let engine = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let payload = Payload::inline(move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt() < 2 {
            return Err(PayloadError::failed("not yet"));
        }
        Ok(json!({ "attempt": ctx.attempt() }))
    });

    let handle = engine.submit(payload, SubmitOptions::new()).await.unwrap();
    assert_eq!(handle.wait(WAIT).await.unwrap(), json!({ "attempt": 2 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(handle.is_successful());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_task_times_out() {
    let engine = started(fast_config());
    let opts = SubmitOptions::new()
        .timeout(Duration::from_millis(50))
        .max_retries(0);

    let started_at = Instant::now();
    let handle = engine
        .submit(sleeping(Duration::from_millis(200), "late"), opts)
        .await
        .unwrap();
    let err = handle.wait(WAIT).await.unwrap_err();

    assert_eq!(
        err,
        WaitError::Task(TaskError::Timeout {
            timeout: Duration::from_millis(50),
            attempts: 1,
        })
    );
    assert_eq!(handle.state(), TaskState::TimedOut);
    assert!(started_at.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.get_stats().tasks.timed_out, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_attempt_is_retried_while_retries_remain() {
    let mut config = fast_config();
    // long backoff keeps the task observable between attempts
    config.retry = RetryPolicy::new(Duration::from_millis(300), Duration::from_millis(300));
    let engine = started(config);
    let opts = SubmitOptions::new()
        .timeout(Duration::from_millis(50))
        .max_retries(1);

    let handle = engine
        .submit(sleeping(Duration::from_millis(200), "late"), opts)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(1), || handle.attempt() == 1).await);
    assert_eq!(handle.state(), TaskState::Pending);

    let err = handle.wait(WAIT).await.unwrap_err();
    assert_eq!(
        err,
        WaitError::Task(TaskError::Timeout {
            timeout: Duration::from_millis(50),
            attempts: 2,
        })
    );
    assert_eq!(handle.state(), TaskState::TimedOut);
    assert_eq!(engine.get_stats().tasks.retried, 1);
}

#[rstest]
#[case::fast_path_on(true)]
#[case::fast_path_off(false)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_closure_observes_its_deadline(#[case] fast_path: bool) {
    let mut config = fast_config();
    config.fast_path = fast_path;
    let engine = started(config);
    let saw_flag = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&saw_flag);

    let payload = Payload::inline(move |ctx| {
        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(400) {
            if ctx.is_cancelled() {
                seen.store(true, Ordering::SeqCst);
                return Err(PayloadError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(json!("finished"))
    });
    let opts = SubmitOptions::new()
        .timeout(Duration::from_millis(50))
        .max_retries(0);

    let submitted = Instant::now();
    let handle = engine.submit(payload, opts).await.unwrap();
    let err = handle.wait(WAIT).await.unwrap_err();

    assert!(matches!(err, WaitError::Task(TaskError::Timeout { attempts: 1, .. })));
    assert_eq!(handle.state(), TaskState::TimedOut);
    assert!(
        submitted.elapsed() < Duration::from_millis(300),
        "wait resolved after {:?}, not at the deadline",
        submitted.elapsed()
    );
    assert!(eventually(Duration::from_secs(1), || saw_flag.load(Ordering::SeqCst)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_timeout_leaves_task_untouched() {
    let engine = started(fast_config());
    engine.pause();
    let handle = engine
        .submit(Payload::inline(|_| Ok(json!(1))), SubmitOptions::new())
        .await
        .unwrap();

    let err = handle.wait(Some(Duration::from_millis(20))).await.unwrap_err();
    assert_eq!(err, WaitError::Timeout(Duration::from_millis(20)));
    assert_eq!(handle.state(), TaskState::Pending);

    engine.resume();
    assert_eq!(handle.wait(WAIT).await.unwrap(), json!(1));
}

#[test]
fn full_lane_rejects_submission() {
    let mut config = fast_config();
    config.lanes = LaneCapacities::uniform(2);
    let engine = Engine::new(config).unwrap();
    let noop = || Payload::inline(|_| Ok(json!(null)));

    engine.try_submit(noop(), SubmitOptions::new()).unwrap();
    engine.try_submit(noop(), SubmitOptions::new()).unwrap();
    let err = engine.try_submit(noop(), SubmitOptions::new()).unwrap_err();
    assert_eq!(
        err,
        SubmissionError::QueueFull {
            priority: Priority::Normal,
            capacity: 2,
        }
    );

    // other lanes are unaffected
    let high = SubmitOptions::new().priority(Priority::High);
    engine.try_submit(noop(), high).unwrap();

    let stats = engine.get_stats();
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.tasks.rejected, 1);
    assert_eq!(stats.tasks.submitted, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_admission_waits_for_capacity() {
    let mut config = single_worker_config();
    config.lanes = LaneCapacities::uniform(1);
    config.admission = AdmissionPolicy::Block;
    let engine = started(config);
    engine.pause();

    let first = engine
        .submit(Payload::inline(|_| Ok(json!("first"))), SubmitOptions::new())
        .await
        .unwrap();
    let blocked = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit(Payload::inline(|_| Ok(json!("second"))), SubmitOptions::new())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    engine.resume();
    let second = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked submit was released")
        .unwrap()
        .unwrap();
    assert_eq!(first.wait(WAIT).await.unwrap(), json!("first"));
    assert_eq!(second.wait(WAIT).await.unwrap(), json!("second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_submit_fails_when_engine_shuts_down() {
    let mut config = single_worker_config();
    config.lanes = LaneCapacities::uniform(1);
    config.admission = AdmissionPolicy::Block;
    let engine = started(config);
    engine.pause();

    engine
        .submit(Payload::inline(|_| Ok(json!(null))), SubmitOptions::new())
        .await
        .unwrap();
    let blocked = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit(Payload::inline(|_| Ok(json!(null))), SubmitOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.shutdown(ShutdownOptions::immediate()).await;
    let result = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked submit returned")
        .unwrap();
    assert_eq!(result.unwrap_err(), SubmissionError::EngineShutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_before_start() {
    let engine = started(fast_config());
    engine.pause();
    let trace = Trace::new();
    let handle = engine
        .submit(trace.step("never"), SubmitOptions::new())
        .await
        .unwrap();

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(
        handle.wait(WAIT).await.unwrap_err(),
        WaitError::Task(TaskError::Cancelled)
    );

    engine.resume();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(trace.entries().is_empty());
    let stats = engine.get_stats();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.tasks.cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_running_task_is_cooperative() {
    let engine = started(fast_config());
    let payload = Payload::from_async(|ctx| async move {
        while !ctx.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(PayloadError::Cancelled)
    });
    let handle = engine.submit(payload, SubmitOptions::new()).await.unwrap();

    assert!(eventually(Duration::from_secs(2), || handle.state() == TaskState::Running).await);
    assert!(!handle.cancel());

    let err = handle.wait(WAIT).await.unwrap_err();
    assert_eq!(err, WaitError::Task(TaskError::Cancelled));
    assert_eq!(handle.state(), TaskState::Cancelled);
    // cancelled tasks are not retried
    assert_eq!(handle.attempt(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_retry_links_back_to_original() {
    let engine = started(fast_config());
    let handle = engine
        .submit(failing("broken"), SubmitOptions::new().max_retries(0))
        .await
        .unwrap();
    assert!(handle.wait(WAIT).await.is_err());
    assert_eq!(
        handle.get_error(),
        Some(TaskError::Execution(PayloadError::failed("broken")))
    );

    let retried = handle.retry().unwrap();
    assert_ne!(retried.id(), handle.id());
    assert!(retried.wait(WAIT).await.is_err());
    let snapshot = retried.snapshot();
    assert_eq!(snapshot.retry_of, Some(handle.id()));
    assert_eq!(snapshot.max_retries, 0);

    let ok = engine
        .submit(Payload::inline(|_| Ok(json!(1))), SubmitOptions::new())
        .await
        .unwrap();
    ok.wait(WAIT).await.unwrap();
    assert!(ok.retry().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_payload_fails_the_task() {
    let engine = started(fast_config());
    let payload = Payload::inline(|ctx| {
        if ctx.attempt() == 0 {
            panic!("payload blew up");
        }
        Ok(json!(null))
    });
    let handle = engine
        .submit(payload, SubmitOptions::new().max_retries(0))
        .await
        .unwrap();

    let err = handle.wait(WAIT).await.unwrap_err();
    match err {
        WaitError::Task(error) => match error.payload_error() {
            Some(PayloadError::Panicked(msg)) => assert!(msg.contains("payload blew up")),
            other => panic!("expected a panic error, got {other:?}"),
        },
        other => panic!("expected a task error, got {other:?}"),
    }

    // the worker survived
    let after = engine
        .submit(Payload::inline(|_| Ok(json!("alive"))), SubmitOptions::new())
        .await
        .unwrap();
    assert_eq!(after.wait(WAIT).await.unwrap(), json!("alive"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_fire_once_with_the_outcome() {
    let engine = started(fast_config());
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = engine
        .submit(Payload::inline(|_| Ok(json!(42))), SubmitOptions::new())
        .await
        .unwrap();
    handle.on_success(move |value| {
        let _ = tx.send(value.clone());
    });

    let value = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(42));

    // registering after completion runs right away
    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.add_callback(move |outcome| {
        let _ = tx.send(outcome.is_ok());
    });
    assert!(rx.await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_task_waits_for_its_delay() {
    let engine = started(fast_config());
    let submitted = Instant::now();
    let handle = engine
        .submit(
            Payload::inline(|_| Ok(json!("later"))),
            SubmitOptions::new().delay(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(handle.state(), TaskState::Pending);
    assert_eq!(handle.wait(WAIT).await.unwrap(), json!("later"));
    assert!(submitted.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_scales_up_under_pressure_and_back_down() {
    let mut config = fast_config();
    config.lanes = LaneCapacities::uniform(16);
    config.workers = WorkerBounds {
        min_workers: 1,
        max_workers: 4,
    };
    config.scaler.scale_up_threshold = 0.3;
    config.scaler.scale_down_threshold = 0.05;
    let engine = started(config);

    let mut handles = Vec::new();
    for priority in [Priority::Normal, Priority::High] {
        for _ in 0..16 {
            let opts = SubmitOptions::new().priority(priority);
            handles.push(
                engine
                    .submit(sleeping(Duration::from_millis(50), "done"), opts)
                    .await
                    .unwrap(),
            );
        }
    }

    let mut peak_active = 0;
    let mut peak_total = 0;
    while handles.iter().any(|h| !h.is_complete()) {
        let workers = engine.get_stats().workers;
        peak_active = peak_active.max(workers.active);
        peak_total = peak_total.max(workers.total);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(peak_active >= 2, "pool never grew (peak {peak_active})");
    assert_eq!(peak_total, 4, "pool did not reach max_workers under sustained load");

    assert!(
        eventually(Duration::from_secs(3), || engine.get_stats().workers.active == 1).await,
        "pool did not shrink back to min_workers"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_track_completed_work() {
    let engine = started(fast_config());
    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(
            engine
                .submit(Payload::inline(move |_| Ok(json!(i))), SubmitOptions::new())
                .await
                .unwrap(),
        );
    }
    for handle in &handles {
        handle.wait(WAIT).await.unwrap();
    }

    let stats = engine.get_stats();
    assert!(stats.running);
    assert_eq!(stats.tasks.submitted, 8);
    assert_eq!(stats.tasks.succeeded, 8);
    assert_eq!(stats.tasks.processed, 8);
    assert_eq!(stats.timing.samples, 8);
    assert!(stats.timing.p95_ms <= stats.timing.max_ms);
    assert_eq!(stats.stored_results, 8);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["tasks"]["succeeded"], 8);
    assert_eq!(json["lanes"].as_array().unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledge_drops_stored_result() {
    let engine = started(fast_config());
    let handle = engine
        .submit(Payload::inline(|_| Ok(json!("kept"))), SubmitOptions::new())
        .await
        .unwrap();
    handle.wait(WAIT).await.unwrap();

    assert!(engine.handle(handle.id()).is_some());
    assert!(handle.acknowledge());
    assert!(engine.handle(handle.id()).is_none());
    assert!(!handle.acknowledge());
    // the handle itself still knows the result
    assert_eq!(handle.get_result(), Some(json!("kept")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_results_are_swept() {
    let mut config = fast_config();
    config.result_ttl = Some(Duration::from_millis(30));
    let engine = started(config);
    let handle = engine
        .submit(Payload::inline(|_| Ok(json!(1))), SubmitOptions::new())
        .await
        .unwrap();
    handle.wait(WAIT).await.unwrap();

    let id = handle.id();
    assert!(eventually(Duration::from_secs(2), || engine.handle(id).is_none()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_finishes_queued_work() {
    let engine = started(fast_config());
    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(
            engine
                .submit(sleeping(Duration::from_millis(20), "ok"), SubmitOptions::new())
                .await
                .unwrap(),
        );
    }

    let report = engine
        .shutdown(ShutdownOptions::default().timeout(Duration::from_secs(5)))
        .await;
    assert!(report.drained_in_time);
    assert_eq!(report.stragglers, 0);
    assert_eq!(report.cancelled_after_deadline, 0);
    assert!(handles.iter().all(|h| h.is_successful()));
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_shutdown_cancels_pending_and_closes_admission() {
    let engine = started(fast_config());
    engine.pause();
    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(
            engine
                .submit(Payload::inline(|_| Ok(json!(null))), SubmitOptions::new())
                .await
                .unwrap(),
        );
    }

    let report = engine.shutdown(ShutdownOptions::immediate()).await;
    assert_eq!(report.cancelled_pending, 3);
    assert!(!report.already_stopped);
    assert!(handles.iter().all(|h| h.state() == TaskState::Cancelled));

    let err = engine
        .try_submit(Payload::inline(|_| Ok(json!(null))), SubmitOptions::new())
        .unwrap_err();
    assert_eq!(err, SubmissionError::EngineShutdown);

    let again = engine.shutdown(ShutdownOptions::immediate()).await;
    assert!(again.already_stopped);
    assert!(matches!(engine.start(), Err(EngineError::Stopped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_engine_holds_work_until_resumed() {
    let engine = started(fast_config());
    engine.pause();

    let handle = engine
        .submit(Payload::inline(|_| Ok(json!("ran"))), SubmitOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), TaskState::Pending);
    assert!(engine.get_stats().paused);

    engine.resume();
    assert_eq!(handle.wait(WAIT).await.unwrap(), json!("ran"));
    engine.shutdown(ShutdownOptions::immediate()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_twice_is_an_error() {
    let engine = started(fast_config());
    assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
    engine.shutdown(ShutdownOptions::immediate()).await;
}
