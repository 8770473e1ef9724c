// src/error.rs
//! Error types shared by the resolution engine, the model store and the
//! retraining pipeline.

use thiserror::Error;

/// Failure modes of a training invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("insufficient training samples: found {found}, need at least {required}")]
    InsufficientSamples { found: usize, required: usize },

    #[error("model fit failed: {0}")]
    Fit(String),
}

#[derive(Error, Debug)]
pub enum ResolutionError {
    /// No resolution backend was initialized for this process.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("training error: {0}")]
    Training(#[from] TrainingError),

    /// Read, write or deserialize failure on model or feedback persistence.
    #[error("storage error: {0}")]
    Storage(String),

    /// Failure while scoring a record with the probabilistic matcher.
    #[error("matching error: {0}")]
    Matching(String),

    #[error("invalid tenant code '{0}'")]
    InvalidTenantCode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ResolutionError {
    fn from(e: std::io::Error) -> Self {
        ResolutionError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ResolutionError {
    fn from(e: serde_json::Error) -> Self {
        ResolutionError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for ResolutionError {
    fn from(e: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        ResolutionError::Storage(format!("{:#}", e))
    }
}

pub type Result<T> = std::result::Result<T, ResolutionError>;
