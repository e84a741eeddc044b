//! Configuration for the triage router
//!
//! Plain serde structs with sensible defaults. A deployment can start from
//! `TriageConfig::default()`, load a TOML/JSON file, or overlay a handful of
//! environment variables with [`TriageConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TriageError};

/// Refusal copy used when a safety gate trips.
pub const DEFAULT_REFUSAL: &str = "Sorry, I can only answer questions related to airline travel.";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub runner: RunnerConfig,
    pub recorder: RecorderConfig,
    pub broadcast: BroadcastConfig,
    pub router: RouterConfig,
    pub models: ModelConfig,
    pub retry: RetryConfig,
}

/// How strictly "one handoff per turn" is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandoffLimit {
    /// Follow every valid handoff the handlers request
    #[default]
    Advisory,
    /// Ignore any valid handoff after the first within a turn
    Enforced,
}

/// Turn execution loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum handler steps per turn
    pub max_turns: usize,
    pub handoff_limit: HandoffLimit,
    pub refusal_message: String,
    /// Deadline for one handler model call
    pub handler_timeout: Duration,
    /// Deadline for one tool call
    pub tool_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            handoff_limit: HandoffLimit::Advisory,
            refusal_message: DEFAULT_REFUSAL.to_string(),
            handler_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
        }
    }
}

/// Event recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Characters kept from long content and metadata values
    pub truncate_limit: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            truncate_limit: 200,
        }
    }
}

/// Delta broadcaster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Queue depth per subscriber; a full queue drops the update
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 64,
        }
    }
}

/// Confidence router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// At or above: execute the intent tool
    pub execute_threshold: f64,
    /// At or above (and below execute): ask for clarification
    pub clarify_threshold: f64,
    pub tool_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            execute_threshold: 0.7,
            clarify_threshold: 0.4,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

/// Model names per tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Cheap, fast model for gates and intent classification
    pub classifier_model: String,
    /// Model driving handler decisions
    pub reasoning_model: String,
    pub completion_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            classifier_model: "gpt-4.1-mini".to_string(),
            reasoning_model: "gpt-4o".to_string(),
            completion_timeout: Duration::from_secs(45),
        }
    }
}

/// Retry configuration for transient completion failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Upper bound on `RetryConfig::max_retries`.
pub const MAX_RETRIES_CAP: usize = 10;

impl TriageConfig {
    /// Defaults overlaid with `TRIAGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TriageError::Config(format!("{}: {e}", path.as_ref().display())))?;
        let config: Self = toml::from_str(&contents).map_err(|e| TriageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| TriageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("TRIAGE_MAX_TURNS") {
            config.runner.max_turns = parse_var("TRIAGE_MAX_TURNS", &raw)?;
        }
        if let Some(raw) = lookup("TRIAGE_HANDOFF_LIMIT") {
            config.runner.handoff_limit = match raw.to_lowercase().as_str() {
                "advisory" => HandoffLimit::Advisory,
                "enforced" => HandoffLimit::Enforced,
                other => {
                    return Err(TriageError::Config(format!(
                        "TRIAGE_HANDOFF_LIMIT must be 'advisory' or 'enforced', got '{other}'"
                    )))
                }
            };
        }
        if let Some(raw) = lookup("TRIAGE_SUBSCRIBER_CAPACITY") {
            config.broadcast.subscriber_capacity = parse_var("TRIAGE_SUBSCRIBER_CAPACITY", &raw)?;
        }
        if let Some(model) = lookup("TRIAGE_CLASSIFIER_MODEL") {
            config.models.classifier_model = model;
        }
        if let Some(model) = lookup("TRIAGE_REASONING_MODEL") {
            config.models.reasoning_model = model;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.runner.max_turns == 0 {
            return Err(TriageError::Config("max_turns must be at least 1".into()));
        }
        if self.broadcast.subscriber_capacity == 0 {
            return Err(TriageError::Config(
                "subscriber_capacity must be at least 1".into(),
            ));
        }
        let r = &self.router;
        if !(0.0..=1.0).contains(&r.clarify_threshold)
            || !(0.0..=1.0).contains(&r.execute_threshold)
            || r.clarify_threshold > r.execute_threshold
        {
            return Err(TriageError::Config(format!(
                "router thresholds must satisfy 0 <= clarify ({}) <= execute ({}) <= 1",
                r.clarify_threshold, r.execute_threshold
            )));
        }
        let retry = &self.retry;
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(TriageError::Config(format!(
                "backoff_multiplier must be a finite number >= 1, got {}",
                retry.backoff_multiplier
            )));
        }
        if retry.max_retries > MAX_RETRIES_CAP {
            return Err(TriageError::Config(format!(
                "max_retries must be at most {MAX_RETRIES_CAP}, got {}",
                retry.max_retries
            )));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(TriageError::Config(
                "retry initial_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TriageError::Config(format!("{key} has invalid value '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TriageConfig::default();
        assert_eq!(config.runner.max_turns, 10);
        assert_eq!(config.runner.handoff_limit, HandoffLimit::Advisory);
        assert_eq!(config.recorder.truncate_limit, 200);
        assert_eq!(config.router.execute_threshold, 0.7);
        assert_eq!(config.router.clarify_threshold, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overlay_applies_known_keys() {
        let config = TriageConfig::from_lookup(lookup(&[
            ("TRIAGE_MAX_TURNS", "4"),
            ("TRIAGE_HANDOFF_LIMIT", "Enforced"),
            ("TRIAGE_CLASSIFIER_MODEL", "small-model"),
        ]))
        .unwrap();
        assert_eq!(config.runner.max_turns, 4);
        assert_eq!(config.runner.handoff_limit, HandoffLimit::Enforced);
        assert_eq!(config.models.classifier_model, "small-model");
        assert_eq!(config.models.reasoning_model, "gpt-4o");
    }

    #[test]
    fn env_overlay_rejects_garbage() {
        let err = TriageConfig::from_lookup(lookup(&[("TRIAGE_MAX_TURNS", "many")])).unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));

        let err = TriageConfig::from_lookup(lookup(&[("TRIAGE_MAX_TURNS", "0")])).unwrap_err();
        assert!(err.to_string().contains("max_turns"));
    }

    #[test]
    fn json_config_fills_missing_sections_with_defaults() {
        let config =
            TriageConfig::from_json(r#"{"runner": {"handoff_limit": "enforced"}}"#).unwrap();
        assert_eq!(config.runner.handoff_limit, HandoffLimit::Enforced);
        assert_eq!(config.runner.max_turns, 10);
        assert_eq!(config.broadcast.subscriber_capacity, 64);
    }

    #[test]
    fn toml_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        std::fs::write(&path, "[runner]\nmax_turns = 3\n\n[recorder]\ntruncate_limit = 50\n")
            .unwrap();
        let config = TriageConfig::from_file(&path).unwrap();
        assert_eq!(config.runner.max_turns, 3);
        assert_eq!(config.recorder.truncate_limit, 50);
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut config = TriageConfig::default();
        config.router.clarify_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_settings_are_bounded() {
        let mut config = TriageConfig::default();
        config.retry.backoff_multiplier = -2.0;
        assert!(config.validate().unwrap_err().to_string().contains("backoff_multiplier"));

        config.retry.backoff_multiplier = f32::INFINITY;
        assert!(config.validate().is_err());

        config.retry.backoff_multiplier = 2.0;
        config.retry.max_retries = 100;
        assert!(config.validate().unwrap_err().to_string().contains("max_retries"));

        config.retry.max_retries = MAX_RETRIES_CAP;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_config_with_bad_retry_is_rejected() {
        let err = TriageConfig::from_json(r#"{"retry": {"backoff_multiplier": 0.5}}"#).unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));
    }
}
