//! Log sink error types.

/// Result type alias for log sink operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// Errors raised while registering log hooks.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// A hook was configured with an unusable value.
    #[error("invalid {hook} hook configuration: {message}")]
    InvalidHookConfig { hook: String, message: String },

    /// A global subscriber is already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

impl From<LogError> for pipestep_types::StepError {
    fn from(err: LogError) -> Self {
        pipestep_types::StepError::Configuration(err.to_string())
    }
}
