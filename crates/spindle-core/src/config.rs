//! Engine configuration.
//!
//! Every field has a default, so `EngineConfig::default()` is a working
//! engine. Values can be deserialized (all structs are `#[serde(default)]`)
//! or overridden from `SPINDLE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Priority;
use crate::error::ConfigError;
use crate::queue::RetryPolicy;

/// What `Engine::submit` does when the target lane is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Fail with `SubmissionError::QueueFull`.
    #[default]
    Reject,
    /// Wait until the lane has room.
    Block,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(AdmissionPolicy::Reject),
            "block" => Ok(AdmissionPolicy::Block),
            other => Err(format!("unknown admission policy `{other}`")),
        }
    }
}

/// Per-lane capacities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneCapacities {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl LaneCapacities {
    pub fn uniform(capacity: usize) -> Self {
        Self {
            critical: capacity,
            high: capacity,
            normal: capacity,
            low: capacity,
        }
    }

    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        Priority::ALL.iter().map(|p| self.get(*p)).sum()
    }
}

impl Default for LaneCapacities {
    fn default() -> Self {
        Self::uniform(1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerBounds {
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for WorkerBounds {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_workers: 2,
            max_workers: cpus.clamp(2, 32),
        }
    }
}

/// AutoScaler tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Scale up when `queued / capacity` is above this.
    pub scale_up_threshold: f64,
    /// Scale down when `queued / capacity` is below this.
    pub scale_down_threshold: f64,
    /// Growth factor applied to the current worker count.
    pub scale_factor: f64,
    /// Minimum time between two scaling actions.
    pub cooldown: Duration,
    /// Control loop period.
    pub tick: Duration,
    /// Evaluate right after each enqueue instead of waiting for the next tick.
    pub react_on_enqueue: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.10,
            scale_factor: 1.5,
            cooldown: Duration::from_secs(2),
            tick: Duration::from_millis(250),
            react_on_enqueue: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lanes: LaneCapacities,
    pub admission: AdmissionPolicy,
    pub workers: WorkerBounds,
    pub scaler: ScalerConfig,
    pub retry: RetryPolicy,
    pub default_max_retries: u32,
    pub default_timeout: Option<Duration>,
    /// Run synchronous payloads inline on the worker.
    pub fast_path: bool,
    /// Delay-buffer promotion and result-retention sweep period.
    pub sweep_interval: Duration,
    /// Drop terminal results older than this. `None` keeps them until acknowledged.
    pub result_ttl: Option<Duration>,
    /// How many recent attempt durations feed the p95/p99 figures.
    pub timing_window: usize,
    /// Upper bound on a single idle `dequeue` wait inside a worker.
    pub idle_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: LaneCapacities::default(),
            admission: AdmissionPolicy::default(),
            workers: WorkerBounds::default(),
            scaler: ScalerConfig::default(),
            retry: RetryPolicy::default(),
            default_max_retries: 3,
            default_timeout: None,
            fast_path: true,
            sweep_interval: Duration::from_millis(200),
            result_ttl: None,
            timing_window: 1024,
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let WorkerBounds {
            min_workers,
            max_workers,
        } = self.workers;
        if max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if min_workers > max_workers {
            return Err(ConfigError::WorkerBounds {
                min: min_workers,
                max: max_workers,
            });
        }
        if let Some(p) = Priority::ALL.into_iter().find(|p| self.lanes.get(*p) == 0) {
            return Err(ConfigError::ZeroCapacity(p));
        }
        let (down, up) = (
            self.scaler.scale_down_threshold,
            self.scaler.scale_up_threshold,
        );
        if !(0.0..=1.0).contains(&down) || !(0.0..=1.0).contains(&up) || down >= up {
            return Err(ConfigError::Thresholds { down, up });
        }
        if self.scaler.scale_factor.is_nan() || self.scaler.scale_factor <= 1.0 {
            return Err(ConfigError::ScaleFactor(self.scaler.scale_factor));
        }
        if self.scaler.tick.is_zero() {
            return Err(ConfigError::ZeroInterval("scaler.tick"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sweep_interval"));
        }
        if self.idle_poll.is_zero() {
            return Err(ConfigError::ZeroInterval("idle_poll"));
        }
        Ok(())
    }

    /// Defaults overridden by `SPINDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPINDLE_MIN_WORKERS")? {
            cfg.workers.min_workers = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPINDLE_MAX_WORKERS")? {
            cfg.workers.max_workers = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "SPINDLE_LANE_CAPACITY")? {
            cfg.lanes = LaneCapacities::uniform(v);
        }
        if let Some(v) = parse_var::<AdmissionPolicy, _>(&lookup, "SPINDLE_ADMISSION")? {
            cfg.admission = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "SPINDLE_DEFAULT_MAX_RETRIES")? {
            cfg.default_max_retries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SPINDLE_COOLDOWN_MS")? {
            cfg.scaler.cooldown = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SPINDLE_RESULT_TTL_MS")? {
            cfg.result_ttl = Some(Duration::from_millis(v));
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Env {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
