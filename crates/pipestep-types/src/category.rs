//! Error categories reported through logs and telemetry.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Telemetry-visible classification of a failed run.
///
/// The category is independent of the process exit code, which is always
/// `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// Nothing more specific was recorded.
    #[default]
    Undefined,
    /// Resolution or validation of the step configuration failed.
    Configuration,
    /// A required secret reference could not be resolved.
    Credentials,
    /// A child process exited with a non-zero code.
    ExternalTool,
    /// An HTTP dependency answered with 4xx/5xx.
    Service,
    /// Network, DNS, TLS or bucket failures.
    Infrastructure,
    /// A step-specific business rule was violated.
    Compliance,
    /// The cancellation grace period was exceeded.
    Aborted,
    /// Set explicitly by the step body.
    Custom,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Undefined,
        ErrorCategory::Configuration,
        ErrorCategory::Credentials,
        ErrorCategory::ExternalTool,
        ErrorCategory::Service,
        ErrorCategory::Infrastructure,
        ErrorCategory::Compliance,
        ErrorCategory::Aborted,
        ErrorCategory::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Undefined => "undefined",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Credentials => "credentials",
            ErrorCategory::ExternalTool => "externalTool",
            ErrorCategory::Service => "service",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Compliance => "compliance",
            ErrorCategory::Aborted => "aborted",
            ErrorCategory::Custom => "custom",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, ErrorCategory::Undefined)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown error category '{}'", s))
    }
}
