use thiserror::Error;

/// Errors surfaced by the Host Client. Maps onto the taxonomy in §7:
/// transient failures are retried internally before ever reaching this
/// type; callers only see a terminal classification.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transient host error: {0}")]
    Transient(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unrecoverable host error: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HostError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, HostError::Conflict(_))
    }
}

/// Per-phase error wrapper used by the poll loop's "record and continue"
/// handler (Design Notes: exception control flow across phases becomes
/// explicit error returns).
#[derive(Debug, Error)]
#[error("phase {phase} failed for issue #{issue}: {source}")]
pub struct PollError {
    pub phase: &'static str,
    pub issue: i64,
    #[source]
    pub source: HostError,
}

impl PollError {
    pub fn new(phase: &'static str, issue: i64, source: HostError) -> Self {
        Self {
            phase,
            issue,
            source,
        }
    }
}

/// Errors loading or validating the per-project configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
