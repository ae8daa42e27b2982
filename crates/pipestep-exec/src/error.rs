//! Error types for process and HTTP execution.

use pipestep_types::StepError;

/// Result type alias for exec operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors raised by the command runner and HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child process could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The child process exited unsuccessfully.
    #[error("'{program}' exited with code {code}")]
    ExitCode { program: String, code: i32 },

    /// The run was cancelled while waiting.
    #[error("{what} cancelled")]
    Cancelled { what: String },

    /// Network, DNS or TLS failure.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// An HTTP dependency answered with an error status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Client options could not be applied.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. })
    }
}

impl From<reqwest::Error> for ExecError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        ExecError::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<ExecError> for StepError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Spawn { program, .. } => StepError::ExternalTool {
                tool: program,
                code: -1,
            },
            ExecError::ExitCode { program, code } => StepError::ExternalTool {
                tool: program,
                code,
            },
            ExecError::Cancelled { what } => StepError::Aborted(format!("{} cancelled", what)),
            ExecError::Status { status, message } => StepError::Service { status, message },
            ExecError::InvalidConfig(msg) => StepError::Configuration(msg),
            e @ (ExecError::Transport { .. } | ExecError::Io(_)) => {
                StepError::Infrastructure(e.to_string())
            }
        }
    }
}
