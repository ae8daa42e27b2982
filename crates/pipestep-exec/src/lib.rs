//! Process and network access for step bodies.
//!
//! - [`CommandRunner`]: launches child processes, optionally streaming their
//!   output line by line into the log, and terminates them on cancellation
//! - [`HttpClient`]: a shared, cloneable HTTP client with retry, bearer-token
//!   injection, custom trust roots and an optional cookie jar
//! - [`retry`]: bounded exponential backoff shared with other crates
//!
//! Both honor the run's [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod command;
pub mod error;
pub mod http;
pub mod retry;

pub use command::{CommandOutput, CommandRunner, CommandSpec, DEFAULT_GRACE_PERIOD};
pub use error::{ExecError, Result};
pub use http::{HttpClient, HttpClientBuilder, ensure_success};
pub use retry::{RetryPolicy, Retryable, with_retry};
