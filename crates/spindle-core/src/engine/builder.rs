//! EngineBuilder: wiring and start-up validation.

use std::sync::Arc;

use super::Engine;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

/// Builds an `Engine`.
///
/// ```ignore
/// let engine = Engine::builder()
///     .config(EngineConfig::from_env()?)
///     .clock(Arc::new(SystemClock))
///     .build()?;
/// ```
///
/// `build()` validates the configuration, so a bad config fails here rather
/// than at the first submission.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for wall-clock timestamps. Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Id source. Defaults to a `UlidGenerator` over the system clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(SystemClock)),
        };
        Ok(Engine::from_parts(self.config, clock, ids))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
