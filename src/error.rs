use thiserror::Error;

use crate::manifest::BurnState;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: BurnState, to: BurnState },

    #[error("Signal rejected by security gateway: {0}")]
    SecurityRejected(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job {job_id} exceeded its retry budget ({retries} retries)")]
    MaxRetriesExceeded { job_id: String, retries: u32 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job request: {0}")]
    InvalidJob(String),

    #[error("Burn device error: {0}")]
    Device(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    pub fn parse(path: impl Into<String>, source: serde_json::Error) -> Self {
        RelayError::Parse {
            path: path.into(),
            source,
        }
    }

    /// Store outages are retried on the next poll tick instead of failing a job.
    /// A rejected path or a 4xx answer will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::StoreUnavailable(e) if e.is_transient())
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
