//! AutoScaler: sizes the worker pool from queue pressure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::{ScalerConfig, WorkerBounds};
use crate::engine::Shared;
use crate::worker::WorkerCounts;

/// Why the scaler did nothing this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Pressure is between the two thresholds.
    WithinBand,
    Cooldown,
    AtMaximum,
    AtMinimum,
    /// Pressure is low but every worker is busy.
    NoIdleWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    /// Spawn this many workers.
    Up(usize),
    /// Retire this many workers.
    Down(usize),
    Hold(HoldReason),
}

/// Pure scaling policy plus the time of its last action.
#[derive(Debug, Clone)]
pub struct AutoScaler {
    config: ScalerConfig,
    bounds: WorkerBounds,
    last_action: Option<Instant>,
}

impl AutoScaler {
    pub fn new(config: ScalerConfig, bounds: WorkerBounds) -> Self {
        Self {
            config,
            bounds,
            last_action: None,
        }
    }

    /// Decide what to do given `pressure` (queued / capacity) and the current
    /// worker counts. Does not record anything; call `record_action` once a
    /// non-hold decision was applied.
    ///
    /// - Up when `pressure > scale_up_threshold`: grow by
    ///   `max(1, ceil(active * scale_factor) - active)`, clamped so live
    ///   workers never exceed `max_workers`.
    /// - Down when `pressure < scale_down_threshold` and some worker is idle:
    ///   retire back to `min_workers`.
    /// - Fewer live workers than `min_workers` (or none at all while work is
    ///   queued) is repaired immediately, ignoring the cooldown.
    pub fn evaluate(&self, pressure: f64, workers: &WorkerCounts, now: Instant) -> ScaleDecision {
        let WorkerBounds {
            min_workers,
            max_workers,
        } = self.bounds;
        let active = workers.active;
        let live = workers.total;

        if live < min_workers {
            return ScaleDecision::Up(min_workers - live);
        }
        // min_workers may be 0: queued work must still get a worker
        if live == 0 && pressure > 0.0 {
            return ScaleDecision::Up(1);
        }

        let cooling = self
            .last_action
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.cooldown);

        if pressure > self.config.scale_up_threshold {
            if live >= max_workers {
                return ScaleDecision::Hold(HoldReason::AtMaximum);
            }
            if cooling {
                return ScaleDecision::Hold(HoldReason::Cooldown);
            }
            let target = (active as f64 * self.config.scale_factor).ceil() as usize;
            let add = target.saturating_sub(active).max(1).min(max_workers - live);
            return ScaleDecision::Up(add);
        }

        if pressure < self.config.scale_down_threshold {
            if active <= min_workers {
                return ScaleDecision::Hold(HoldReason::AtMinimum);
            }
            if workers.idle == 0 {
                return ScaleDecision::Hold(HoldReason::NoIdleWorker);
            }
            if cooling {
                return ScaleDecision::Hold(HoldReason::Cooldown);
            }
            return ScaleDecision::Down(active - min_workers);
        }

        ScaleDecision::Hold(HoldReason::WithinBand)
    }

    pub fn record_action(&mut self, now: Instant) {
        self.last_action = Some(now);
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }
}

/// Control loop: evaluates every tick and on every nudge from `submit`.
pub(crate) async fn run_scaler(shared: Arc<Shared>) {
    let mut scaler = AutoScaler::new(shared.config.scaler.clone(), shared.config.workers.clone());
    let mut tick = tokio::time::interval(shared.config.scaler.tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(target: "spindle::scaler", "scaler loop started");

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tick.tick() => {}
            _ = shared.scaler_nudge.notified() => {}
        }

        let pressure = shared.queue.ready_pressure();
        let counts = shared.pool.counts();
        let now = Instant::now();
        match scaler.evaluate(pressure, &counts, now) {
            ScaleDecision::Up(n) => {
                let spawned = Shared::spawn_workers(&shared, n);
                scaler.record_action(now);
                info!(
                    target: "spindle::scaler",
                    pressure,
                    active = counts.active,
                    added = spawned.len(),
                    "scaled worker pool up"
                );
            }
            ScaleDecision::Down(n) => {
                let retired = shared.pool.retire_workers(n);
                scaler.record_action(now);
                info!(
                    target: "spindle::scaler",
                    pressure,
                    active = counts.active,
                    retired = retired.len(),
                    "scaled worker pool down"
                );
            }
            ScaleDecision::Hold(_) => {}
        }
    }
    debug!(target: "spindle::scaler", "scaler loop stopped");
}
