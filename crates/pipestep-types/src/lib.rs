//! Shared types for the pipestep framework.
//!
//! These types are used by every other crate in the workspace:
//! - [`metadata`]: the declarative description of a step (parameters, secrets,
//!   containers, outputs) that drives configuration resolution
//! - [`category`]: the telemetry-visible failure classification
//! - [`error`]: the typed error returned by step bodies

pub mod category;
pub mod error;
pub mod metadata;

pub use category::ErrorCategory;
pub use error::{MetadataError, StepError, StepResult};
pub use metadata::{
    Alias, Container, EnvOutput, ErrorPattern, Outputs, ParamType, Parameter, ReportOutput,
    ResourceKind, ResourceRef, Scope, SecretDecl, SecretKind, StepMetadata, Validation,
};
