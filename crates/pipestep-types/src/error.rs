//! Error types shared across the framework.

use crate::ErrorCategory;

/// Result type returned by step bodies.
pub type StepResult<T = ()> = std::result::Result<T, StepError>;

/// Typed error a step body (or any framework component) returns.
///
/// Every variant maps onto exactly one [`ErrorCategory`].
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Configuration could not be resolved or failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A secret reference could not be resolved.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// A child process exited unsuccessfully.
    #[error("'{tool}' failed with exit code {code}")]
    ExternalTool { tool: String, code: i32 },

    /// An HTTP dependency answered with an error status.
    #[error("service responded with HTTP {status}: {message}")]
    Service { status: u16, message: String },

    /// Network, DNS, TLS or storage failure.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// A domain rule was violated.
    #[error("compliance violation: {0}")]
    Compliance(String),

    /// The run was cancelled.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Explicitly categorized by the step body.
    #[error("{0}")]
    Custom(String),

    /// The step body panicked.
    #[error("step body panicked: {0}")]
    Panic(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    /// The telemetry category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StepError::Configuration(_) => ErrorCategory::Configuration,
            StepError::Credentials(_) => ErrorCategory::Credentials,
            StepError::ExternalTool { .. } => ErrorCategory::ExternalTool,
            StepError::Service { .. } => ErrorCategory::Service,
            StepError::Infrastructure(_) => ErrorCategory::Infrastructure,
            StepError::Compliance(_) => ErrorCategory::Compliance,
            StepError::Aborted(_) => ErrorCategory::Aborted,
            StepError::Custom(_) => ErrorCategory::Custom,
            StepError::Panic(_) | StepError::Other(_) => ErrorCategory::Undefined,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        StepError::Configuration(msg.into())
    }

    pub fn compliance(msg: impl Into<String>) -> Self {
        StepError::Compliance(msg.into())
    }
}

/// Errors raised while loading or checking step metadata.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to parse step metadata: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("step '{step}': duplicate parameter '{param}'")]
    DuplicateParameter { step: String, param: String },

    #[error("step '{step}': parameter '{param}' references unknown secret '{secret}'")]
    UnknownSecret {
        step: String,
        param: String,
        secret: String,
    },

    #[error("step '{step}': default of parameter '{param}' is not a valid {expected}")]
    DefaultType {
        step: String,
        param: String,
        expected: String,
    },

    #[error("step '{step}': invalid validation pattern on '{param}': {message}")]
    InvalidPattern {
        step: String,
        param: String,
        message: String,
    },
}

impl From<MetadataError> for StepError {
    fn from(err: MetadataError) -> Self {
        StepError::Configuration(err.to_string())
    }
}
