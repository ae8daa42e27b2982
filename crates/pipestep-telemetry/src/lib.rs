//! Telemetry for step runs.
//!
//! A run fills exactly one [`TelemetryRecord`]. On exit the finalizer hands
//! it, in order, to:
//! 1. a [`TelemetrySink`] (HTTP backend or no-op)
//! 2. a [`LogForwarder`], together with the collected log entries
//! 3. an [`EventPublisher`], as a CloudEvent, when pub/sub is enabled
//!
//! Each dispatch reports its own error; none of them affects the others.

pub mod error;
pub mod forwarder;
pub mod pubsub;
pub mod record;
pub mod sink;

pub use error::{Result, TelemetryError};
pub use forwarder::{BATCH_SIZE, LogForwarder, SplunkForwarder, SplunkSettings};
pub use pubsub::{CloudEvent, EventPublisher, PubSubPublisher, PubSubSettings, STEP_FINISHED};
pub use record::{TelemetryHandle, TelemetryRecord, commit_hash_vars};
pub use sink::{HttpTelemetrySink, NoopTelemetrySink, TelemetrySink};
