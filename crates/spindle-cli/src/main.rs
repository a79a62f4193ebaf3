use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spindle_core::{
    ChainExecutor, Engine, EngineConfig, Payload, PayloadError, Priority, ShutdownOptions,
    SpindleError, SubmitOptions, TaskContext, TaskHandler,
};

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

/// Fails its first `n` invocations, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn invoke(&self, ctx: TaskContext) -> Result<Value, PayloadError> {
        let greeting: Greeting = ctx.args_as()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(PayloadError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        Ok(json!(format!("Hello, {}!", greeting.name)))
    }
}

fn label(text: &'static str) -> Payload {
    Payload::inline(move |_| Ok(json!(text)))
}

#[tokio::main]
async fn main() -> Result<(), SpindleError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut config = EngineConfig::from_env()?;
    config.retry.base_delay = Duration::from_millis(50);
    let engine = Engine::builder().config(config).build()?;
    engine.start()?;

    // (A) retries: two failures, then success on the third attempt
    let hello = engine
        .submit(
            Payload::handler(Arc::new(HelloHandler::new(2))),
            SubmitOptions::new().args(json!({ "name": "spindle" })),
        )
        .await?;
    let greeting = hello.wait(Some(Duration::from_secs(5))).await?;
    info!(task_id = %hello.id(), attempts = hello.attempt() + 1, %greeting, "hello finished");

    // (B) priorities: a critical task overtakes queued low ones
    engine.pause();
    let mut batch = Vec::new();
    for _ in 0..5 {
        let opts = SubmitOptions::new().priority(Priority::Low);
        batch.push(engine.submit(label("low"), opts).await?);
    }
    let opts = SubmitOptions::new().priority(Priority::Critical);
    batch.push(engine.submit(label("critical"), opts).await?);
    engine.resume();
    for handle in &batch {
        handle.wait(Some(Duration::from_secs(5))).await?;
    }

    // (C) timeouts: the attempt deadline fires long before the sleep ends
    let slow = Payload::from_async(|_| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(json!("too late"))
    });
    let opts = SubmitOptions::new()
        .timeout(Duration::from_millis(100))
        .max_retries(0);
    let timed = engine.submit(slow, opts).await?;
    if let Err(e) = timed.wait(Some(Duration::from_secs(5))).await {
        warn!(task_id = %timed.id(), error = %e, "slow task did not finish");
    }

    // (D) chain: fetch -> transform -> store
    let mut chain = ChainExecutor::new(&engine);
    let fetch = chain.add_task(label("fetched"), &[]);
    let transform = chain.add_task(label("transformed"), &[fetch]);
    chain.add_task(label("stored"), &[transform]);
    let run = chain.execute()?;
    let results = run.wait(Some(Duration::from_secs(5))).await?;
    info!(chain_id = %run.id(), %results, "chain finished");

    let stats = engine.get_stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    );

    let report = engine.shutdown(ShutdownOptions::default()).await;
    info!(
        drained_in_time = report.drained_in_time,
        stragglers = report.stragglers,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "shutdown complete"
    );
    Ok(())
}
