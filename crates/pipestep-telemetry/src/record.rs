//! The per-run telemetry record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipestep_types::ErrorCategory;
use serde::{Deserialize, Serialize};

/// Environment variables consulted for the commit hash, prefix first.
pub fn commit_hash_vars(prefix: &str) -> [String; 3] {
    [
        format!("{}_commitHash", prefix),
        "GIT_COMMIT".to_string(),
        "GITHUB_SHA".to_string(),
    ]
}

/// One record per run, filled by the finalizer and shipped on exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub step_name: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub correlation_id: String,
    /// Milliseconds, as a decimal string.
    #[serde(default)]
    pub duration: String,
    /// `"0"` for success, `"1"` for failure.
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_category: String,
    #[serde(default)]
    pub custom_label: String,
    #[serde(default)]
    pub custom_value: String,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    #[serde(default)]
    pub pipeline_url_hash: String,
    #[serde(default)]
    pub build_url_hash: String,
}

impl TelemetryRecord {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_commit_hash(mut self, commit_hash: impl Into<String>) -> Self {
        self.commit_hash = commit_hash.into();
        self
    }

    /// Record duration and outcome. `category` is ignored on success.
    pub fn fill(&mut self, duration: Duration, failed: bool, category: ErrorCategory) {
        // Sub-millisecond runs still report a positive duration.
        self.duration = duration.as_millis().max(1).to_string();
        if failed {
            self.error_code = "1".to_string();
            self.error_category = category.to_string();
        } else {
            self.error_code = "0".to_string();
            self.error_category = String::new();
        }
    }

    pub fn failed(&self) -> bool {
        self.error_code == "1"
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration.parse().ok()
    }
}

/// Shared, append-only access to the record for step bodies.
#[derive(Debug, Clone, Default)]
pub struct TelemetryHandle {
    inner: Arc<Mutex<TelemetryRecord>>,
}

impl TelemetryHandle {
    pub fn new(record: TelemetryRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(record)),
        }
    }

    pub fn set_custom(&self, label: impl Into<String>, value: impl Into<String>) {
        let mut record = self.inner.lock();
        record.custom_label = label.into();
        record.custom_value = value.into();
    }

    pub fn set_custom_data(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().custom_data.insert(key.into(), value.into());
    }

    pub fn set_url_hashes(&self, pipeline: impl Into<String>, build: impl Into<String>) {
        let mut record = self.inner.lock();
        record.pipeline_url_hash = pipeline.into();
        record.build_url_hash = build.into();
    }

    pub fn fill(&self, duration: Duration, failed: bool, category: ErrorCategory) {
        self.inner.lock().fill(duration, failed, category);
    }

    /// A copy of the record as it stands.
    pub fn snapshot(&self) -> TelemetryRecord {
        self.inner.lock().clone()
    }
}
