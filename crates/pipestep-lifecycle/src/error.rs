//! Error types for the registry and driver setup.

use pipestep_types::MetadataError;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Failures outside a step run. Failures inside a run never surface as
/// errors; they end up in the [`RunOutcome`](crate::RunOutcome).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{0}' is registered twice")]
    DuplicateStep(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}
