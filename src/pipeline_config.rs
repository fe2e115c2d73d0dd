use std::collections::HashMap;

use serde::Deserialize;

use crate::errors::ConfigError;

/// One entry in the configured status sequence (§6 Configuration inputs).
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    pub name: String,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Per-project configuration document, loaded from TOML. Bridges the
/// runtime [`crate::config::Config`] the way the teacher's `ForgeConfig`
/// bridges its own `Config`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub project: String,
    pub statuses: Vec<StatusConfig>,
    #[serde(default)]
    pub artifacts: HashMap<String, Vec<String>>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_grace")]
    pub assignment_grace_secs: i64,
    #[serde(default = "default_cooldown")]
    pub recovery_cooldown_secs: i64,
    /// "In Review"-equivalent status name; the only status that triggers
    /// the draft->ready + request-review behavior in §4.5.
    #[serde(default = "default_review_status")]
    pub review_status: String,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_grace() -> i64 {
    120
}

fn default_cooldown() -> i64 {
    300
}

fn default_review_status() -> String {
    "In Review".to_string()
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: "<in-memory>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: PipelineConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.statuses.is_empty() {
            return Err(ConfigError::Invalid(
                "configuration must declare at least one status".to_string(),
            ));
        }
        if !self.statuses.iter().any(|s| s.name == self.review_status) {
            return Err(ConfigError::Invalid(format!(
                "review_status {:?} is not one of the configured statuses",
                self.review_status
            )));
        }
        Ok(())
    }

    pub fn agents_for(&self, status: &str) -> &[String] {
        self.statuses
            .iter()
            .find(|s| s.name == status)
            .map(|s| s.agents.as_slice())
            .unwrap_or(&[])
    }

    /// Status sequence order, used for pass-through (L3) and to compute
    /// "the next status" from an arbitrary one.
    pub fn status_after(&self, status: &str) -> Option<&str> {
        let idx = self.statuses.iter().position(|s| s.name == status)?;
        self.statuses.get(idx + 1).map(|s| s.name.as_str())
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.status_after(status).is_none()
    }
}
