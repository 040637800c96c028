//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `ASSESS_*` environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimate::EstimatorConfig;
use crate::evidence::EvidenceLimits;
use crate::passes::ReasoningConfig;
use crate::records::RiskLevel;
use crate::scheduler::{BatchingConfig, RetryPolicy};
use crate::session::SessionConfig;

pub const CONFIG_PATH_ENV: &str = "ASSESS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    /// Reuse the mapping status for passing controls in smart mode.
    pub skip_passing_controls: bool,
    /// Gap risks that get individual remediation calls in smart mode.
    pub deep_reasoning_risk_levels: Vec<RiskLevel>,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            skip_passing_controls: true,
            deep_reasoning_risk_levels: vec![RiskLevel::High, RiskLevel::Critical],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessConfig {
    pub reasoning: ReasoningConfig,
    pub batching: BatchingConfig,
    pub retry: RetryPolicy,
    pub prioritization: PrioritizationConfig,
    pub estimator: EstimatorConfig,
    pub evidence: EvidenceLimits,
    pub sessions: SessionConfig,
    pub server: ServerConfig,
}

impl AssessConfig {
    /// Defaults, then `path` (or `$ASSESS_CONFIG`), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `ASSESS_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(model) = lookup("ASSESS_MODEL").filter(|m| !m.trim().is_empty()) {
            self.reasoning.model = model;
        }
        if let Some(model) = lookup("ASSESS_DEEP_MODEL").filter(|m| !m.trim().is_empty()) {
            self.reasoning.deep_model = model;
        }
        override_parsed(&lookup, "ASSESS_MAX_CONCURRENT_BATCHES", &mut self.batching.max_concurrent_batches)?;
        override_parsed(&lookup, "ASSESS_REQUESTS_PER_MINUTE", &mut self.batching.requests_per_minute)?;
        override_parsed(&lookup, "ASSESS_MAPPING_BATCH_SIZE", &mut self.batching.mapping_batch_size)?;
        override_parsed(&lookup, "ASSESS_ARTIFACT_BATCH_SIZE", &mut self.batching.artifact_batch_size)?;
        override_parsed(&lookup, "ASSESS_VALIDATION_BATCH_SIZE", &mut self.batching.validation_batch_size)?;
        override_parsed(&lookup, "ASSESS_REMEDIATION_BATCH_SIZE", &mut self.batching.remediation_batch_size)?;
        override_parsed(&lookup, "ASSESS_SKIP_PASSING_CONTROLS", &mut self.prioritization.skip_passing_controls)?;
        if let Some(bind) = lookup("ASSESS_BIND").filter(|b| !b.trim().is_empty()) {
            self.server.bind = bind;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.batching;
        for (name, value) in [
            ("batching.mapping_batch_size", b.mapping_batch_size),
            ("batching.artifact_batch_size", b.artifact_batch_size),
            ("batching.validation_batch_size", b.validation_batch_size),
            ("batching.remediation_batch_size", b.remediation_batch_size),
            ("batching.max_concurrent_batches", b.max_concurrent_batches),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if b.requests_per_minute == 0 {
            return Err(ConfigError::Invalid("batching.requests_per_minute must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.estimator.output_token_share) {
            return Err(ConfigError::Invalid(format!(
                "estimator.output_token_share must be within [0, 1], got {}",
                self.estimator.output_token_share
            )));
        }
        if self.evidence.max_files == 0 {
            return Err(ConfigError::Invalid("evidence.max_files must be at least 1".into()));
        }
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value: raw })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AssessConfig::default();
        assert_eq!(config.reasoning.model, "google/gemini-2.5-flash");
        assert_eq!(config.batching.mapping_batch_size, 15);
        assert_eq!(config.batching.artifact_batch_size, 15);
        assert_eq!(config.batching.validation_batch_size, 10);
        assert_eq!(config.batching.max_concurrent_batches, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.prioritization.skip_passing_controls);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        config.validate().unwrap();
    }

    #[test]
    fn toml_then_env_layering() {
        let mut config = AssessConfig::from_toml(
            r#"
            [batching]
            validation_batch_size = 4
            requests_per_minute = 30

            [prioritization]
            deep_reasoning_risk_levels = ["critical"]
            "#,
        )
        .unwrap();
        assert_eq!(config.batching.validation_batch_size, 4);
        assert_eq!(config.batching.mapping_batch_size, 15, "untouched keys keep defaults");
        assert_eq!(config.prioritization.deep_reasoning_risk_levels, vec![RiskLevel::Critical]);

        config
            .apply_env(env(&[
                ("ASSESS_REQUESTS_PER_MINUTE", "120"),
                ("ASSESS_SKIP_PASSING_CONTROLS", "false"),
                ("ASSESS_MODEL", "openai/gpt-4o-mini"),
                ("ASSESS_ARTIFACT_BATCH_SIZE", "5"),
            ]))
            .unwrap();
        assert_eq!(config.batching.requests_per_minute, 120);
        assert_eq!(config.batching.artifact_batch_size, 5);
        assert!(!config.prioritization.skip_passing_controls);
        assert_eq!(config.reasoning.model, "openai/gpt-4o-mini");
    }

    #[test]
    fn bad_env_and_zero_limits_are_rejected() {
        let mut config = AssessConfig::default();
        let err = config
            .apply_env(env(&[("ASSESS_MAX_CONCURRENT_BATCHES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "ASSESS_MAX_CONCURRENT_BATCHES", .. }));

        config.batching.validation_batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AssessConfig::default();
        config.estimator.output_token_share = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = AssessConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
