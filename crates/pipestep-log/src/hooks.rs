//! Log hooks.
//!
//! Hooks receive every masked entry synchronously. A hook must not log
//! through `tracing` itself and must never panic or fail.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::{LogEntry, LogError, LogLevel, Result};

/// Receives every entry emitted through the log sink.
pub trait LogHook: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    fn on_entry(&self, entry: &LogEntry);
}

// ─────────────────────────────────────────────────────────────────────────────
// Fatal hook
// ─────────────────────────────────────────────────────────────────────────────

/// Writes `<path>/<step>_errorDetails.json` for the first fatal entry.
#[derive(Debug)]
pub struct FatalHook {
    correlation_id: String,
    path: PathBuf,
    fired: AtomicBool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetails<'a> {
    correlation_id: &'a str,
    step_name: &'a str,
    category: &'a str,
    message: &'a str,
    error: &'a str,
    time: String,
}

impl FatalHook {
    pub fn new(correlation_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            path: path.into(),
            fired: AtomicBool::new(false),
        }
    }

    /// Whether a fatal entry has been handled.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Path of the details file for a step.
    pub fn details_path(&self, step_name: &str) -> PathBuf {
        details_path(&self.path, step_name)
    }
}

fn details_path(dir: &Path, step_name: &str) -> PathBuf {
    dir.join(format!("{}_errorDetails.json", step_name))
}

impl LogHook for FatalHook {
    fn name(&self) -> &'static str {
        "fatal"
    }

    fn on_entry(&self, entry: &LogEntry) {
        if entry.level != LogLevel::Fatal || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let details = ErrorDetails {
            correlation_id: &self.correlation_id,
            step_name: &entry.step_name,
            category: entry.field("category").unwrap_or("undefined"),
            message: &entry.message,
            error: entry.error.as_deref().unwrap_or_default(),
            time: entry.time.to_rfc3339(),
        };
        if let Ok(json) = serde_json::to_vec_pretty(&details) {
            let _ = std::fs::write(details_path(&self.path, &entry.step_name), json);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collector hook
// ─────────────────────────────────────────────────────────────────────────────

/// Shared in-memory buffer of log entries.
#[derive(Debug, Clone, Default)]
pub struct LogCollector {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Take every buffered entry, leaving the buffer empty.
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.message.clone()).collect()
    }

    fn push(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Appends every entry to a [`LogCollector`].
#[derive(Debug, Clone, Default)]
pub struct CollectorHook {
    collector: LogCollector,
}

impl CollectorHook {
    pub fn new(collector: LogCollector) -> Self {
        Self { collector }
    }

    pub fn collector(&self) -> &LogCollector {
        &self.collector
    }
}

impl LogHook for CollectorHook {
    fn name(&self) -> &'static str {
        "collector"
    }

    fn on_entry(&self, entry: &LogEntry) {
        self.collector.push(entry.clone());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote sink hook
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteEvent<'a> {
    correlation_id: &'a str,
    #[serde(flatten)]
    entry: &'a LogEntry,
}

/// Forwards warnings and errors to a remote aggregator in the background.
///
/// Delivery failures are dropped silently.
pub struct RemoteSinkHook {
    tx: Mutex<Option<mpsc::UnboundedSender<LogEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    min_level: LogLevel,
}

impl RemoteSinkHook {
    /// Start the forwarding task. Must be called inside a tokio runtime.
    pub fn spawn(dsn: &str, correlation_id: impl Into<String>) -> Result<Self> {
        let url = Url::parse(dsn).map_err(|e| LogError::InvalidHookConfig {
            hook: "remote sink".to_string(),
            message: format!("invalid dsn '{}': {}", dsn, e),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LogError::InvalidHookConfig {
                hook: "remote sink".to_string(),
                message: format!("unsupported dsn scheme '{}'", url.scheme()),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LogError::InvalidHookConfig {
                hook: "remote sink".to_string(),
                message: e.to_string(),
            })?;

        let correlation_id = correlation_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let event = RemoteEvent {
                    correlation_id: &correlation_id,
                    entry: &entry,
                };
                let _ = client.post(url.clone()).json(&event).send().await;
            }
        });

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            min_level: LogLevel::Warn,
        })
    }

    /// Stop accepting entries and wait for queued ones to be delivered.
    pub async fn flush(&self, timeout: Duration) {
        self.tx.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(timeout, task).await;
        }
    }
}

impl LogHook for RemoteSinkHook {
    fn name(&self) -> &'static str {
        "remote sink"
    }

    fn on_entry(&self, entry: &LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(entry.clone());
        }
    }
}

impl std::fmt::Debug for RemoteSinkHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSinkHook")
            .field("open", &self.tx.lock().is_some())
            .finish()
    }
}
