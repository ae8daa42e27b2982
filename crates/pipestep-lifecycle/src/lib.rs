//! Step lifecycle for pipestep.
//!
//! Every step invocation goes through the same driver:
//!
//! - **PRE-RUN**: log sink setup, configuration and hook loading, secret
//!   resolution and validation ([`StepDriver`])
//! - **RUN**: the [`StepBody`] runs on its own task with a [`StepContext`]
//! - **FINALIZE**: a [`Finalizer`] persists outputs, cleans up secrets and
//!   ships telemetry on every exit path, panics and cancellation included
//!
//! Steps are looked up by name in a flat [`StepRegistry`].

pub mod context;
pub mod driver;
pub mod error;
pub mod finalizer;
pub mod registry;

pub use context::{CategoryCell, ContextParts, SharedOutputs, StepContext};
pub use driver::{DEFAULT_ENV_ROOT, RunOptions, Services, StepDriver, run_step};
pub use error::{LifecycleError, Result};
pub use finalizer::{
    Finalizer, FinalizerBuilder, Phase, PhaseRecord, PhaseStatus, RunOutcome, RunState,
};
pub use registry::{StepBody, StepEntry, StepRegistry, TypedBody, typed};
