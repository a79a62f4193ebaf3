//! Worker loop and per-attempt execution.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkerStatus;
use crate::domain::{AttemptOutcome, AttemptRecord, TaskRecord, TaskState};
use crate::engine::Shared;
use crate::error::TaskError;
use crate::payload::{Payload, PayloadError, PayloadKind, TaskContext};

/// How one attempt ended, before retry classification.
enum Run {
    Completed(Result<Value, PayloadError>),
    TimedOut(Duration),
}

/// Loop run by each worker until it is drained or the queue closes.
pub(crate) async fn run_worker(worker: Arc<WorkerStatus>, shared: Arc<Shared>) {
    let worker_id = worker.id();
    debug!(target: "spindle::worker", worker_id, "worker started");

    loop {
        if worker.is_draining() {
            break;
        }

        // dequeue may wait; race it against the drain signal
        let next = tokio::select! {
            biased;
            _ = worker.drained() => break,
            next = shared.queue.dequeue(Some(shared.config.idle_poll)) => next,
        };

        let Some(record) = next else {
            if shared.queue.is_closed() {
                break;
            }
            continue;
        };

        worker.mark_busy();
        execute(&shared, &record, worker_id).await;
        worker.mark_idle();
    }

    worker.mark_stopped();
    debug!(target: "spindle::worker", worker_id, "worker stopped");
}

/// Run one attempt of `record` and write the outcome back.
pub(crate) async fn execute(shared: &Shared, record: &Arc<TaskRecord>, worker_id: usize) {
    let Some(attempt) = record.try_start(shared.clock.now()) else {
        debug!(
            target: "spindle::worker",
            task_id = %record.id(),
            worker_id,
            "skipping task that left the pending state while queued"
        );
        return;
    };

    let started_at = shared.clock.now();
    let started = Instant::now();
    let (ctx, token) = record.context(attempt);
    debug!(
        target: "spindle::worker",
        task_id = %record.id(),
        priority = %record.priority(),
        attempt,
        worker_id,
        kind = ?record.kind(),
        "attempt started"
    );

    let run = invoke(record, ctx, &token).await;

    let elapsed = started.elapsed();
    shared.stats.record_attempt(elapsed);
    let finished_at = shared.clock.now();
    let history = |outcome| {
        AttemptRecord::new(
            attempt,
            Some(worker_id),
            started_at,
            finished_at,
            elapsed,
            outcome,
        )
    };

    let error = match run {
        Run::Completed(Ok(value)) => {
            // counters first, so a woken waiter already sees them
            shared.stats.record_succeeded();
            record.finish(
                TaskState::Succeeded,
                Ok(value),
                Some(history(AttemptOutcome::Succeeded)),
                finished_at,
            );
            debug!(
                target: "spindle::worker",
                task_id = %record.id(),
                attempt,
                worker_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "task succeeded"
            );
            return;
        }
        Run::Completed(Err(e)) => TaskError::Execution(e),
        Run::TimedOut(timeout) => TaskError::Timeout {
            timeout,
            attempts: attempt + 1,
        },
    };

    // caller cancelled while it ran: never retried
    if record.cancel_requested() {
        shared.stats.record_cancelled();
        record.finish(
            TaskState::Cancelled,
            Err(TaskError::Cancelled),
            Some(history(AttemptOutcome::Cancelled)),
            finished_at,
        );
        info!(
            target: "spindle::worker",
            task_id = %record.id(),
            attempt,
            worker_id,
            "task cancelled while running"
        );
        return;
    }

    let timed_out = matches!(error, TaskError::Timeout { .. });
    let attempt_outcome = if timed_out {
        AttemptOutcome::TimedOut
    } else {
        AttemptOutcome::Failed(error.to_string())
    };

    if attempt < record.max_retries() {
        let delay = shared.config.retry.next_delay(attempt);
        warn!(
            target: "spindle::worker",
            task_id = %record.id(),
            attempt,
            max_retries = record.max_retries(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed; retry scheduled"
        );
        record.schedule_retry(error, history(attempt_outcome), delay);
        shared.queue.enqueue_forced(Arc::clone(record));
        shared.stats.record_retried();
        return;
    }

    let (state, terminal) = if timed_out {
        (TaskState::TimedOut, error)
    } else if record.max_retries() > 0 {
        (
            TaskState::Failed,
            TaskError::RetryExhausted {
                attempts: attempt + 1,
                last: Box::new(error),
            },
        )
    } else {
        (TaskState::Failed, error)
    };
    warn!(
        target: "spindle::worker",
        task_id = %record.id(),
        attempts = attempt + 1,
        worker_id,
        state = %state,
        error = %terminal,
        "task failed"
    );
    if timed_out {
        shared.stats.record_timed_out();
    } else {
        shared.stats.record_failed();
    }
    record.finish(state, Err(terminal), Some(history(attempt_outcome)), finished_at);
}

async fn invoke(record: &TaskRecord, ctx: TaskContext, token: &CancellationToken) -> Run {
    let timeout = record.timeout();
    let Some(payload) = record.payload().cloned() else {
        return Run::Completed(Err(PayloadError::failed("task has no payload")));
    };

    match (record.kind(), payload) {
        // Direct is only assigned to untimed closures
        (PayloadKind::Direct, Payload::Inline(f)) => Run::Completed(
            catch_unwind(AssertUnwindSafe(|| f(&ctx)))
                .unwrap_or_else(|panic| Err(PayloadError::Panicked(panic_message(panic)))),
        ),
        (_, Payload::Inline(f)) => {
            let join = tokio::task::spawn_blocking(move || f(&ctx));
            await_detached(join, timeout, token).await
        }
        (_, Payload::Handler(handler)) => {
            let join = tokio::spawn(async move { handler.invoke(ctx).await });
            await_detached(join, timeout, token).await
        }
    }
}

/// Await a spawned payload, racing it against its deadline. On timeout the
/// attempt's token is tripped and the payload keeps running detached.
async fn await_detached(
    mut join: JoinHandle<Result<Value, PayloadError>>,
    timeout: Option<Duration>,
    token: &CancellationToken,
) -> Run {
    let Some(timeout) = timeout else {
        return Run::Completed(flatten(join.await));
    };
    tokio::select! {
        res = &mut join => Run::Completed(flatten(res)),
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            Run::TimedOut(timeout)
        }
    }
}

fn flatten(res: Result<Result<Value, PayloadError>, JoinError>) -> Result<Value, PayloadError> {
    match res {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(PayloadError::Panicked(panic_message(e.into_panic()))),
        Err(_) => Err(PayloadError::Cancelled),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}
