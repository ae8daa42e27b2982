//! Error types for telemetry dispatch.

use pipestep_exec::ExecError;
use pipestep_types::StepError;

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A sink endpoint or credential is unusable.
    #[error("invalid {sink} configuration: {message}")]
    InvalidConfig { sink: &'static str, message: String },

    #[error("{sink} request failed: {source}")]
    Http {
        sink: &'static str,
        #[source]
        source: ExecError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TelemetryError {
    pub(crate) fn http(sink: &'static str) -> impl FnOnce(ExecError) -> Self {
        move |source| TelemetryError::Http { sink, source }
    }
}

impl From<TelemetryError> for StepError {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::InvalidConfig { .. } => StepError::Configuration(err.to_string()),
            other => StepError::Infrastructure(other.to_string()),
        }
    }
}
