//! spindle-core
//!
//! In-process background task engine: prioritised admission, a self-scaling
//! worker pool, retries with backoff, per-attempt timeouts and dependency
//! chains.
//!
//! # Modules
//! - **domain**: ids, priorities, task state machine, the shared task record
//! - **payload**: what a task runs (`Payload`, `TaskHandler`, `TaskContext`)
//! - **queue**: four priority lanes plus the delay buffer, retry backoff
//! - **store**: results by task id, with optional TTL sweeping
//! - **worker**: worker pool and the dispatch loop
//! - **scaler**: pressure-driven pool sizing
//! - **handle**: caller-side `TaskHandle`
//! - **chain**: DAG execution on top of the engine
//! - **engine**: the `Engine` facade, builder and shutdown
//! - **observability**: counters, timings, `EngineStats`
//! - **config** / **error** / **ports**: configuration, error taxonomy, clock and id seams

pub mod chain;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod handle;
pub mod observability;
pub mod payload;
pub mod ports;
pub mod queue;
pub mod scaler;
pub mod store;
pub mod worker;

pub use chain::{ChainExecutor, ChainPolicy, ChainRun};
pub use config::{AdmissionPolicy, EngineConfig, LaneCapacities, ScalerConfig, WorkerBounds};
pub use domain::{ChainId, Priority, SubmitOptions, TaskId, TaskOutcome, TaskSnapshot, TaskState};
pub use engine::{Engine, EngineBuilder, ShutdownOptions, ShutdownReport};
pub use error::{
    ChainError, ConfigError, EngineError, ErrorKind, HandleError, SpindleError, SubmissionError,
    TaskError, WaitError,
};
pub use handle::TaskHandle;
pub use observability::EngineStats;
pub use payload::{Payload, PayloadError, PayloadKind, TaskContext, TaskHandler};
pub use queue::RetryPolicy;
