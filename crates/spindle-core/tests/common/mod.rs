//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use spindle_core::{Engine, EngineConfig, Payload, PayloadError, RetryPolicy, WorkerBounds};
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short intervals everywhere so tests do not sit on default timers.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers = WorkerBounds {
        min_workers: 1,
        max_workers: 4,
    };
    config.retry = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20));
    config.scaler.tick = Duration::from_millis(10);
    config.scaler.cooldown = Duration::from_millis(20);
    config.sweep_interval = Duration::from_millis(10);
    config.idle_poll = Duration::from_millis(50);
    config
}

/// One worker, never scaled: execution order equals dequeue order.
pub fn single_worker_config() -> EngineConfig {
    let mut config = fast_config();
    config.workers = WorkerBounds {
        min_workers: 1,
        max_workers: 1,
    };
    config
}

pub fn started(config: EngineConfig) -> Engine {
    init_tracing();
    let engine = Engine::new(config).expect("valid config");
    engine.start().expect("engine starts");
    engine
}

/// Execution log shared between payloads and the test body.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline payload that appends `label` when it runs and returns it.
    pub fn step(&self, label: impl Into<String>) -> Payload {
        let log = Arc::clone(&self.0);
        let label = label.into();
        Payload::inline(move |_| {
            log.lock().push(label.clone());
            Ok(json!(label))
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub fn failing(message: &'static str) -> Payload {
    Payload::inline(move |_| Err(PayloadError::failed(message)))
}

/// Async payload that sleeps for `duration` and returns `label`.
pub fn sleeping(duration: Duration, label: &'static str) -> Payload {
    Payload::from_async(move |_| async move {
        tokio::time::sleep(duration).await;
        Ok(json!(label))
    })
}

/// Poll `check` every 5ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
