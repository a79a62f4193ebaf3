//! Payloads: the work a task performs.
//!
//! The engine only needs `invoke(context) -> Result<Value, PayloadError>`.
//! Two shapes are accepted:
//! - synchronous closures (`Payload::inline`), eligible for the fast path
//! - async handlers (`Payload::handler`, `Payload::from_async`)
//!
//! `PayloadKind` is chosen once at submission and never changes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::{Priority, TaskId};

/// Error raised by a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum PayloadError {
    #[error("{0}")]
    Failed(String),

    /// The payload noticed `TaskContext::is_cancelled` and stopped.
    #[error("payload stopped after observing cancellation")]
    Cancelled,

    #[error("payload panicked: {0}")]
    Panicked(String),
}

impl PayloadError {
    pub fn failed(message: impl Into<String>) -> Self {
        PayloadError::Failed(message.into())
    }
}

/// What a payload sees while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    priority: Priority,
    attempt: u32,
    args: Value,
    tags: Arc<[String]>,
    metadata: Arc<Map<String, Value>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        priority: Priority,
        attempt: u32,
        args: Value,
        tags: Arc<[String]>,
        metadata: Arc<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            priority,
            attempt,
            args,
            tags,
            metadata,
            cancel,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// 0-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Decode `args` into a typed value.
    pub fn args_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| PayloadError::failed(format!("args decode: {e}")))
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Set when the caller cancelled the task or this attempt hit its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once `is_cancelled` becomes true.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(PayloadError::Cancelled)` once cancelled; handy with `?`.
    pub fn checkpoint(&self) -> Result<(), PayloadError> {
        if self.is_cancelled() {
            Err(PayloadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Async work item.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn invoke(&self, ctx: TaskContext) -> Result<Value, PayloadError>;
}

/// Synchronous work item.
pub type InlineFn = dyn Fn(&TaskContext) -> Result<Value, PayloadError> + Send + Sync;

struct AsyncFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, PayloadError>> + Send,
{
    async fn invoke(&self, ctx: TaskContext) -> Result<Value, PayloadError> {
        (self.f)(ctx).await
    }
}

/// The invocable part of a task. Cheap to clone (retries and `retry()` share it).
#[derive(Clone)]
pub enum Payload {
    Inline(Arc<InlineFn>),
    Handler(Arc<dyn TaskHandler>),
}

impl Payload {
    /// A synchronous closure. Runs inline on the worker when the fast path is on
    /// and the task has no timeout, so keep it short and non-blocking.
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<Value, PayloadError> + Send + Sync + 'static,
    {
        Payload::Inline(Arc::new(f))
    }

    pub fn handler(handler: Arc<dyn TaskHandler>) -> Self {
        Payload::Handler(handler)
    }

    /// An async closure, e.g. `Payload::from_async(|ctx| async move { ... })`.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PayloadError>> + Send + 'static,
    {
        Payload::Handler(Arc::new(AsyncFnHandler { f }))
    }

    /// Static classification done once at submission. A timed closure is
    /// always Wrapped: its deadline must trip the token while it still runs.
    pub fn classify(&self, fast_path: bool, timeout: Option<Duration>) -> PayloadKind {
        match self {
            Payload::Inline(_) if fast_path && timeout.is_none() => PayloadKind::Direct,
            _ => PayloadKind::Wrapped,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Inline(_) => f.write_str("Payload::Inline"),
            Payload::Handler(_) => f.write_str("Payload::Handler"),
        }
    }
}

/// How the worker invokes a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Called inline on the worker, no extra task or allocation.
    Direct,
    /// Runs in its own task (async handlers) or on the blocking pool.
    Wrapped,
}
