use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::diagnosis::DiagnosisSettings;
use crate::executor::UnknownActionPolicy;
use crate::llm::LlmConfig;
use crate::planner::PlanningMode;
use crate::safety::SafetyLimits;
use crate::telemetry::{lookback_window, InvestigationWindow, DEFAULT_Z_THRESHOLD};
use crate::tool_loop::DEFAULT_MAX_ITERATIONS;
use crate::verifier::VerifySettings;

pub const DEFAULT_LOOKBACK_MINUTES: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub z_threshold: f64,
    pub lookback_minutes: i64,
    pub period_secs: u32,
    pub log_limit: usize,
    pub diagnosis_temperature: f64,
    pub max_tokens: u64,
    pub log_line_cap: usize,
    /// Let the reasoning service call diagnostic tools before answering.
    pub tool_loop: bool,
    pub max_tool_iterations: usize,
    pub planning_mode: PlanningMode,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            lookback_minutes: DEFAULT_LOOKBACK_MINUTES,
            period_secs: 300,
            log_limit: 50,
            diagnosis_temperature: 0.2,
            max_tokens: 1024,
            log_line_cap: 10,
            tool_loop: true,
            max_tool_iterations: DEFAULT_MAX_ITERATIONS,
            planning_mode: PlanningMode::Keyword,
        }
    }
}

impl PipelineSettings {
    pub fn investigation_window(&self) -> InvestigationWindow {
        InvestigationWindow {
            lookback: lookback_window(
                self.lookback_minutes,
                chrono::Duration::minutes(DEFAULT_LOOKBACK_MINUTES),
            ),
            period_secs: self.period_secs,
            log_limit: self.log_limit,
        }
    }

    pub fn diagnosis(&self) -> DiagnosisSettings {
        DiagnosisSettings {
            temperature: self.diagnosis_temperature,
            max_tokens: self.max_tokens,
            log_line_cap: self.log_line_cap,
            max_iterations: self.max_tool_iterations,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineSettings,
    pub safety: SafetyLimits,
    pub verify: VerifySettings,
    pub unknown_actions: UnknownActionPolicy,
    pub database_path: PathBuf,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            pipeline: PipelineSettings::default(),
            safety: SafetyLimits::default(),
            verify: VerifySettings::default(),
            unknown_actions: UnknownActionPolicy::default(),
            database_path: PathBuf::from("data/lambda-medic.db"),
        }
    }
}

impl ResponderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then the file if it exists, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) if path.exists() => Self::from_toml_file(path)?,
            _ => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Applies overrides from `lookup`, which is `std::env::var` in
    /// production. Values that fail to parse are ignored with a warning.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(env) = lookup("LLM_API_KEY_ENV") {
            self.llm.api_key_env = env;
        }
        if let Some(path) = lookup("MEDIC_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(value) = parsed(&lookup, "LLM_TEMPERATURE") {
            self.llm.temperature = value;
            self.pipeline.diagnosis_temperature = value;
        }
        if let Some(value) = parsed(&lookup, "MEDIC_MAX_TOOL_ITERATIONS") {
            self.pipeline.max_tool_iterations = value;
        }
        if let Some(value) = parsed(&lookup, "MEDIC_Z_THRESHOLD") {
            self.pipeline.z_threshold = value;
        }
        self
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_platform_constants() {
        let config = ResponderConfig::default();
        assert_eq!(config.pipeline.z_threshold, 2.0);
        assert_eq!(config.pipeline.max_tool_iterations, 10);
        assert_eq!(config.pipeline.log_line_cap, 10);
        assert_eq!(config.safety.max_actions, 5);
        assert_eq!(config.verify.min_memory_mb, 256);
        assert_eq!(config.unknown_actions, UnknownActionPolicy::Acknowledge);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ResponderConfig::from_toml_str(
            r#"
            unknown_actions = "reject"
            database_path = "/var/lib/medic.db"

            [pipeline]
            tool_loop = false
            planning_mode = "structured"

            [safety]
            max_memory_mb = 3008
            "#,
        )
        .expect("parse");

        assert_eq!(config.unknown_actions, UnknownActionPolicy::Reject);
        assert_eq!(config.database_path, PathBuf::from("/var/lib/medic.db"));
        assert!(!config.pipeline.tool_loop);
        assert_eq!(config.pipeline.planning_mode, PlanningMode::Structured);
        assert_eq!(config.pipeline.period_secs, 300);
        assert_eq!(config.safety.max_memory_mb, 3008);
        assert_eq!(config.safety.max_timeout_secs, 900);
        assert_eq!(config.llm, LlmConfig::default());
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LLM_MODEL", "gpt-4o"),
            ("LLM_TEMPERATURE", "0.1"),
            ("MEDIC_MAX_TOOL_ITERATIONS", "3"),
            ("MEDIC_Z_THRESHOLD", "not-a-number"),
        ]);
        let config = ResponderConfig::default()
            .with_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.temperature, 0.1);
        assert_eq!(config.pipeline.diagnosis_temperature, 0.1);
        assert_eq!(config.pipeline.max_tool_iterations, 3);
        assert_eq!(config.pipeline.z_threshold, DEFAULT_Z_THRESHOLD);
    }

    #[test]
    fn oversized_lookback_falls_back_to_default() {
        let config = ResponderConfig::from_toml_str(
            r#"
            [pipeline]
            lookback_minutes = 9223372036854775807
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.pipeline.investigation_window().lookback,
            chrono::Duration::minutes(DEFAULT_LOOKBACK_MINUTES)
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(ResponderConfig::from_toml_str("pipeline = 3").is_err());
    }
}
