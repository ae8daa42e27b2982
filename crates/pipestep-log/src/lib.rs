//! Structured logging for step runs.
//!
//! The log sink is a [`tracing_subscriber::Layer`] that renders every event
//! with the step name and correlation id attached, masks registered secrets,
//! and dispatches the masked entry to registered hooks:
//! - [`FatalHook`]: writes an error-details file on the first fatal entry
//! - [`CollectorHook`]: buffers entries for log forwarding
//! - [`RemoteSinkHook`]: ships warnings and errors to a remote aggregator
//!
//! Code logs through the ordinary `tracing` macros. A fatal entry is an
//! `error!` event carrying `fatal = true`; see [`fatal!`].

pub mod entry;
pub mod error;
pub mod format;
pub mod hooks;
pub mod layer;
pub mod mask;
pub mod patterns;
pub mod sink;

pub use entry::{LogEntry, LogLevel};
pub use error::{LogError, Result};
pub use format::LogFormat;
pub use hooks::{CollectorHook, FatalHook, LogCollector, LogHook, RemoteSinkHook};
pub use layer::StepLogLayer;
pub use mask::SecretMask;
pub use patterns::ErrorPatternMatcher;
pub use sink::{LogSink, SharedBuffer};

/// Emit a fatal log entry.
///
/// Fatal entries trigger the fatal hook. They never terminate the process;
/// the lifecycle driver decides the exit code.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        ::tracing::error!(fatal = true, $($arg)+)
    };
}
