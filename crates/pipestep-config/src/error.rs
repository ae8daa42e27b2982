//! Configuration error types.

use pipestep_types::{ErrorCategory, StepError};

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("failed to parse config file '{path}': {message}")]
    ParseYaml { path: String, message: String },

    /// A value cannot be coerced to the declared parameter type.
    #[error("invalid value for parameter '{param}': expected {expected}, got '{value}'")]
    InvalidValue {
        param: String,
        expected: String,
        value: String,
    },

    /// Mandatory parameter without a value in any layer.
    #[error("mandatory parameter '{0}' is not set")]
    MissingParameter(String),

    /// Mandatory parameter whose secret references all came up empty.
    #[error("secret for mandatory parameter '{0}' could not be resolved")]
    MissingSecret(String),

    /// A declarative constraint rejected the assembled value.
    #[error("parameter '{param}' failed validation: {message}")]
    Validation { param: String, message: String },

    /// Hook configuration that cannot be used.
    #[error("invalid {hook} hook configuration: {message}")]
    InvalidHook { hook: String, message: String },

    /// Credential store or remote store failure.
    #[error("secret resolution failed: {0}")]
    Secret(String),

    /// Remote secret store request failed.
    #[error("remote secret store error at '{path}': {message}")]
    RemoteStore { path: String, message: String },

    /// The configuration does not deserialize into the step's record.
    #[error("configuration does not match the step parameters: {0}")]
    Typed(String),

    #[error("pipeline environment error: {0}")]
    Environment(#[from] pipestep_report::ReportError),
}

impl ConfigError {
    /// Telemetry-visible classification of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConfigError::MissingSecret(_) | ConfigError::Secret(_) | ConfigError::RemoteStore { .. } => {
                ErrorCategory::Credentials
            }
            _ => ErrorCategory::Configuration,
        }
    }
}

impl From<ConfigError> for StepError {
    fn from(err: ConfigError) -> Self {
        match err.category() {
            ErrorCategory::Credentials => StepError::Credentials(err.to_string()),
            _ => StepError::Configuration(err.to_string()),
        }
    }
}
