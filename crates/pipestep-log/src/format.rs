//! Line formats for rendered entries.

use std::str::FromStr;

use crate::{LogEntry, LogLevel};

/// Step name rendered when none has been set yet.
const NO_STEP_NAME: &str = "(noStepName)";

/// How entries are rendered to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// `level step - message [fields] - error`
    #[default]
    Default,
    /// Default prefixed with `HH:MM:SS`.
    Timestamp,
    /// Message, fields and error only.
    Plain,
    /// GitHub Actions workflow commands.
    GitHub,
}

impl LogFormat {
    /// Pick the format, forcing [`LogFormat::GitHub`] inside GitHub Actions.
    pub fn detect(requested: Option<&str>) -> Self {
        if running_in_github_actions() {
            return LogFormat::GitHub;
        }
        requested
            .and_then(|r| r.parse().ok())
            .unwrap_or_default()
    }

    /// Render one entry, without trailing newline.
    pub fn render(&self, entry: &LogEntry) -> String {
        let step = if entry.step_name.is_empty() {
            NO_STEP_NAME
        } else {
            entry.step_name.as_str()
        };
        let fields = render_fields(&entry.fields);
        let error = entry
            .error
            .as_deref()
            .map(|e| format!(" - {}", e))
            .unwrap_or_default();
        let level = entry.level.as_str();

        match self {
            LogFormat::Default => {
                format!("{:<5} {:<6} - {}{}{}", level, step, entry.message, fields, error)
            }
            LogFormat::Timestamp => format!(
                "{} {:<5} {:<6} {}{}{}",
                entry.time.format("%H:%M:%S"),
                level,
                step,
                entry.message,
                fields,
                error
            ),
            LogFormat::Plain => format!("{}{}{}", entry.message, fields, error),
            LogFormat::GitHub => match entry.level {
                LogLevel::Fatal => format!("::error::{}{}", entry.message, error),
                LogLevel::Error => format!("::error::{}{}{}", entry.message, fields, error),
                LogLevel::Warn => format!("::warning::{}{}{}", entry.message, fields, error),
                LogLevel::Debug => format!("::debug::{}{}{}", entry.message, fields, error),
                LogLevel::Info => format!("{}{}{}", entry.message, fields, error),
            },
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(LogFormat::Default),
            "timestamp" => Ok(LogFormat::Timestamp),
            "plain" => Ok(LogFormat::Plain),
            "github" => Ok(LogFormat::GitHub),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

fn render_fields(fields: &[(String, String)]) -> String {
    if fields.is_empty() {
        return String::new();
    }
    let joined = fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");
    format!(" [{}]", joined)
}

fn running_in_github_actions() -> bool {
    ["GITHUB_ACTION", "GITHUB_ACTIONS"].iter().any(|var| {
        std::env::var(var).is_ok_and(|v| !v.is_empty() && v != "false" && v != "0")
    })
}
