//! Per-submission options.

use std::time::Duration;

use serde_json::{Map, Value};

use super::Priority;
use crate::error::SubmissionError;

/// Options for `Engine::submit`.
///
/// `max_retries` and `timeout` fall back to the engine configuration when unset.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub delay: Duration,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub args: Value,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Parse a priority name coming from an outer layer (HTTP, config, ...).
    pub fn priority_named(self, name: &str) -> Result<Self, SubmissionError> {
        Ok(self.priority(name.parse()?))
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_submission_contract() {
        let opts = SubmitOptions::new();
        assert_eq!(opts.priority, Priority::Normal);
        assert_eq!(opts.delay, Duration::ZERO);
        assert!(opts.max_retries.is_none());
        assert!(opts.timeout.is_none());
        assert!(opts.tags.is_empty());
        assert!(opts.metadata.is_empty());
        assert_eq!(opts.args, Value::Null);
    }

    #[test]
    fn builder_chains() {
        let opts = SubmitOptions::new()
            .priority_named("high")
            .unwrap()
            .max_retries(0)
            .tag("email")
            .metadata("tenant", json!("acme"))
            .args(json!({"to": "a@b.c"}));
        assert_eq!(opts.priority, Priority::High);
        assert_eq!(opts.max_retries, Some(0));
        assert_eq!(opts.tags, vec!["email".to_string()]);
        assert_eq!(opts.metadata["tenant"], "acme");
    }

    #[test]
    fn bad_priority_name_is_rejected() {
        let err = SubmitOptions::new().priority_named("asap").unwrap_err();
        assert_eq!(err, SubmissionError::InvalidPriority("asap".into()));
    }
}
