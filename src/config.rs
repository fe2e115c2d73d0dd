use std::path::PathBuf;

use crate::errors::ConfigError;
use crate::pipeline_config::PipelineConfig;

/// Runtime-facing configuration, bridging CLI flags with the loaded
/// [`PipelineConfig`] document — mirrors the teacher's split between a
/// thin `Config` and the richer TOML-backed document it wraps.
pub struct Config {
    pub config_path: PathBuf,
    pub host_base_url: String,
    pub host_token: String,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn load(config_path: PathBuf, log_dir: PathBuf, verbose: bool) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let pipeline = PipelineConfig::load(&config_path)?;
        let host_base_url = std::env::var("PIPELOOM_HOST_URL")
            .unwrap_or_else(|_| "https://host.example/api".to_string());
        let host_token = std::env::var("PIPELOOM_HOST_TOKEN").map_err(|_| {
            ConfigError::Invalid(
                "PIPELOOM_HOST_TOKEN must be set (loaded via environment or .env)".to_string(),
            )
        })?;
        Ok(Self {
            config_path,
            host_base_url,
            host_token,
            log_dir,
            verbose,
            pipeline,
        })
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)
    }
}
