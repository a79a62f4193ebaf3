//! Engine facade: owns the queue, store, worker pool and background loops.

mod builder;
mod lifecycle;

pub use builder::EngineBuilder;
pub use lifecycle::{ShutdownOptions, ShutdownReport};

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AdmissionPolicy, EngineConfig};
use crate::domain::{SubmitOptions, TaskId, TaskRecord};
use crate::domain::record::{CancelRequest, NewTask};
use crate::error::{EngineError, SubmissionError, TaskError};
use crate::handle::TaskHandle;
use crate::observability::{EngineStats, StatsCollector};
use crate::payload::{Payload, PayloadKind};
use crate::ports::{Clock, IdGenerator};
use crate::queue::PriorityQueue;
use crate::scaler::run_scaler;
use crate::store::ResultStore;
use crate::worker::WorkerPool;
use crate::worker::dispatch::run_worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// State shared by the engine, its handles, workers and background loops.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) queue: PriorityQueue,
    pub(crate) store: ResultStore,
    pub(crate) pool: WorkerPool,
    pub(crate) stats: StatsCollector,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    /// Wakes the scaler right after an enqueue.
    pub(crate) scaler_nudge: Notify,
    /// Tripped when submissions close.
    pub(crate) closing: CancellationToken,
    /// Tripped when background loops must stop.
    pub(crate) shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn new(config: EngineConfig, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            queue: PriorityQueue::new(&config.lanes),
            store: ResultStore::new(),
            pool: WorkerPool::new(),
            stats: StatsCollector::new(config.timing_window),
            clock,
            ids,
            scaler_nudge: Notify::new(),
            closing: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Created),
            background: Mutex::new(Vec::new()),
            config,
        }
    }

    pub(crate) fn accepting(&self) -> bool {
        !self.closing.is_cancelled()
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub(crate) fn spawn_workers(shared: &Arc<Self>, n: usize) -> Vec<usize> {
        shared.pool.spawn_workers(n, |status| {
            tokio::spawn(run_worker(status, Arc::clone(shared)))
        })
    }

    /// Build a record from submission options. `payload` is `None` only for
    /// chain completion records.
    pub(crate) fn new_record(
        &self,
        id: TaskId,
        payload: Option<Payload>,
        options: SubmitOptions,
        retry_of: Option<TaskId>,
    ) -> Arc<TaskRecord> {
        let timeout = options.timeout.or(self.config.default_timeout);
        let kind = payload
            .as_ref()
            .map_or(PayloadKind::Wrapped, |p| p.classify(self.config.fast_path, timeout));
        Arc::new(TaskRecord::new(NewTask {
            id,
            payload,
            kind,
            priority: options.priority,
            args: options.args,
            max_retries: options
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            timeout,
            tags: options.tags,
            metadata: options.metadata,
            retry_of,
            scheduled_at: Instant::now() + options.delay,
            created_at: self.clock.now(),
        }))
    }

    /// Admission without waiting: shutdown check, lane capacity, store.
    /// Callers count the rejection, since a blocked submit retries.
    pub(crate) fn admit(
        self: &Arc<Self>,
        record: Arc<TaskRecord>,
    ) -> Result<TaskHandle, SubmissionError> {
        if !self.accepting() {
            return Err(SubmissionError::EngineShutdown);
        }
        self.store.insert(Arc::clone(&record));
        if let Err(e) = self.queue.enqueue(Arc::clone(&record)) {
            self.store.remove(record.id());
            return Err(e);
        }
        self.after_admission(&record);
        Ok(TaskHandle::new(record, Arc::clone(self)))
    }

    /// Admission for work that was already accepted once (chain dependents).
    pub(crate) fn admit_forced(&self, record: Arc<TaskRecord>) {
        self.queue.enqueue_forced(Arc::clone(&record));
        self.after_admission(&record);
    }

    fn after_admission(&self, record: &TaskRecord) {
        self.stats.record_submitted();
        debug!(
            target: "spindle::engine",
            task_id = %record.id(),
            priority = %record.priority(),
            kind = ?record.kind(),
            "task admitted"
        );
        if self.config.scaler.react_on_enqueue {
            self.scaler_nudge.notify_one();
        }
    }

    /// Re-submit a copy of `original`. `None` when it has nothing to run.
    pub(crate) fn resubmit(
        self: &Arc<Self>,
        original: &TaskRecord,
    ) -> Option<Result<TaskHandle, SubmissionError>> {
        let payload = original.payload().cloned()?;
        let options = SubmitOptions {
            priority: original.priority(),
            max_retries: Some(original.max_retries()),
            timeout: original.timeout(),
            tags: original.tags().to_vec(),
            metadata: original.metadata().clone(),
            args: original.args().clone(),
            ..SubmitOptions::default()
        };
        let record = self.new_record(self.ids.task_id(), Some(payload), options, Some(original.id()));
        let admitted = self.admit(record);
        if let Ok(handle) = &admitted {
            info!(
                target: "spindle::engine",
                task_id = %handle.id(),
                retry_of = %original.id(),
                "task resubmitted"
            );
        } else {
            self.stats.record_rejected();
        }
        Some(admitted)
    }

    /// Cancel `record` with `error`. True if it was pending and is now
    /// cancelled; a running task only gets its cooperative flag raised.
    pub(crate) fn cancel(&self, record: &TaskRecord, error: TaskError) -> bool {
        match record.request_cancel(error, self.clock.now()) {
            CancelRequest::Removed => {
                self.queue.remove(record);
                self.stats.record_cancelled();
                info!(target: "spindle::engine", task_id = %record.id(), "task cancelled before start");
                true
            }
            CancelRequest::Signalled => {
                debug!(target: "spindle::engine", task_id = %record.id(), "cancellation requested for running task");
                false
            }
            CancelRequest::Terminal => false,
        }
    }

    /// Cancel everything still queued. Returns how many were cancelled.
    pub(crate) fn cancel_queued(&self) -> usize {
        let now = self.clock.now();
        let mut cancelled = 0;
        for record in self.queue.drain() {
            if record.request_cancel(TaskError::Cancelled, now) == CancelRequest::Removed {
                self.stats.record_cancelled();
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// In-process background task engine.
///
/// Cheap to clone; clones share the same queue, store and workers.
///
/// ```ignore
/// let engine = Engine::builder().config(EngineConfig::from_env()?).build()?;
/// engine.start()?;
/// let handle = engine
///     .submit(Payload::inline(|_| Ok(json!(1))), SubmitOptions::new())
///     .await?;
/// let value = handle.wait(Some(Duration::from_secs(5))).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine with default configuration and the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new().config(config).build()
    }

    pub(crate) fn from_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, clock, ids)),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Spawn `min_workers` workers, the scaler loop and the maintenance loop.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(EngineError::AlreadyStarted),
                Lifecycle::Stopping | Lifecycle::Stopped => return Err(EngineError::Stopped),
            }
        }

        let workers = &self.shared.config.workers;
        Shared::spawn_workers(&self.shared, workers.min_workers);
        let mut background = self.shared.background.lock();
        background.push(tokio::spawn(run_scaler(Arc::clone(&self.shared))));
        background.push(tokio::spawn(lifecycle::run_maintenance(Arc::clone(
            &self.shared,
        ))));
        info!(
            target: "spindle::engine",
            min_workers = workers.min_workers,
            max_workers = workers.max_workers,
            capacity = self.shared.queue.total_capacity(),
            "engine started"
        );
        Ok(())
    }

    /// Submit a task. With `AdmissionPolicy::Block` this waits for lane
    /// capacity instead of failing with `QueueFull`.
    pub async fn submit(
        &self,
        payload: Payload,
        options: SubmitOptions,
    ) -> Result<TaskHandle, SubmissionError> {
        let shared = &self.shared;
        let record = shared.new_record(shared.ids.task_id(), Some(payload), options, None);
        loop {
            // register before trying so a release in between is not missed
            let mut space = pin!(shared.queue.space_available());
            space.as_mut().enable();

            match shared.admit(Arc::clone(&record)) {
                Err(SubmissionError::QueueFull { priority, .. })
                    if shared.config.admission == AdmissionPolicy::Block =>
                {
                    debug!(
                        target: "spindle::engine",
                        task_id = %record.id(),
                        priority = %priority,
                        "lane full; waiting for capacity"
                    );
                    tokio::select! {
                        _ = space => {}
                        _ = shared.closing.cancelled() => {}
                    }
                }
                Err(e) => {
                    shared.stats.record_rejected();
                    return Err(e);
                }
                Ok(handle) => return Ok(handle),
            }
        }
    }

    /// Submit without ever waiting; a full lane fails with `QueueFull`
    /// whatever the admission policy.
    pub fn try_submit(
        &self,
        payload: Payload,
        options: SubmitOptions,
    ) -> Result<TaskHandle, SubmissionError> {
        let shared = &self.shared;
        let record = shared.new_record(shared.ids.task_id(), Some(payload), options, None);
        shared
            .admit(record)
            .inspect_err(|_| shared.stats.record_rejected())
    }

    /// Handle for a task still held by the result store.
    pub fn handle(&self, id: TaskId) -> Option<TaskHandle> {
        self.shared
            .store
            .get(id)
            .map(|record| TaskHandle::new(record, Arc::clone(&self.shared)))
    }

    /// Stop handing out tasks. Running tasks continue; submissions are still
    /// accepted.
    pub fn pause(&self) {
        self.shared.queue.pause();
        info!(target: "spindle::engine", "engine paused");
    }

    pub fn resume(&self) {
        self.shared.queue.resume();
        info!(target: "spindle::engine", "engine resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.queue.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle() == Lifecycle::Running
    }

    pub fn get_stats(&self) -> EngineStats {
        let shared = &self.shared;
        EngineStats {
            running: self.is_running(),
            paused: shared.queue.is_paused(),
            accepting: shared.accepting(),
            lanes: shared.queue.depths().to_vec(),
            queued: shared.queue.queued(),
            capacity: shared.queue.total_capacity(),
            pressure: shared.queue.pressure(),
            ready_pressure: shared.queue.ready_pressure(),
            workers: shared.pool.counts(),
            tasks: shared.stats.counters(),
            timing: shared.stats.timing(),
            stored_results: shared.store.len(),
        }
    }

    /// Graceful shutdown; see `ShutdownOptions`.
    pub async fn shutdown(&self, options: ShutdownOptions) -> ShutdownReport {
        lifecycle::shutdown(&self.shared, options).await
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("lifecycle", &self.shared.lifecycle())
            .field("queued", &self.shared.queue.queued())
            .field("workers", &self.shared.pool.counts())
            .finish()
    }
}
