//! Error types for output persistence.

use std::path::PathBuf;

/// Result type alias for report operations.
pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A key would escape the environment root.
    #[error("invalid pipeline environment key '{0}'")]
    InvalidKey(String),

    /// A stored value does not decode as the requested type.
    #[error("cannot decode '{key}' as {expected}: {message}")]
    Decode {
        key: String,
        expected: String,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upload of '{object}' failed: {message}")]
    Upload { object: String, message: String },

    #[error("invalid report pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl From<ReportError> for pipestep_types::StepError {
    fn from(err: ReportError) -> Self {
        match err {
            ReportError::InvalidKey(_) | ReportError::Pattern { .. } => {
                pipestep_types::StepError::Configuration(err.to_string())
            }
            other => pipestep_types::StepError::Infrastructure(other.to_string()),
        }
    }
}
