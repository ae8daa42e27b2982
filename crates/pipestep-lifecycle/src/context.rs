//! Per-run state handed to the step body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pipestep_config::ResolvedConfig;
use pipestep_exec::{CommandRunner, HttpClient};
use pipestep_log::LogSink;
use pipestep_report::{Link, PipelineEnvironment, ReportRecord, StepOutputs};
use pipestep_telemetry::TelemetryHandle;
use pipestep_types::{ErrorCategory, StepError, StepResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Category recorded explicitly during a run, shared with the finalizer.
#[derive(Debug, Clone, Default)]
pub struct CategoryCell {
    inner: Arc<Mutex<Option<ErrorCategory>>>,
}

impl CategoryCell {
    pub fn set(&self, category: ErrorCategory) {
        *self.inner.lock() = Some(category);
    }

    pub fn get(&self) -> Option<ErrorCategory> {
        *self.inner.lock()
    }
}

/// Outputs accumulated by the body, shared with the finalizer.
pub type SharedOutputs = Arc<Mutex<StepOutputs>>;

/// Everything a step body may use during its run.
///
/// Clones share outputs, telemetry, category and cancellation. Handles for
/// processes and HTTP stop when the run is cancelled.
#[derive(Debug, Clone)]
pub struct StepContext {
    config: ResolvedConfig,
    log: LogSink,
    telemetry: TelemetryHandle,
    outputs: SharedOutputs,
    category: CategoryCell,
    cancel: CancellationToken,
    http: HttpClient,
    runner: CommandRunner,
    env: PipelineEnvironment,
    workdir: PathBuf,
    correlation_id: String,
}

/// Parts of a [`StepContext`] owned by the driver.
#[derive(Debug, Clone)]
pub struct ContextParts {
    pub log: LogSink,
    pub telemetry: TelemetryHandle,
    pub outputs: SharedOutputs,
    pub category: CategoryCell,
    pub cancel: CancellationToken,
    pub http: HttpClient,
    pub runner: CommandRunner,
    pub env: PipelineEnvironment,
    pub workdir: PathBuf,
    pub correlation_id: String,
}

impl StepContext {
    pub fn new(config: ResolvedConfig, parts: ContextParts) -> Self {
        Self {
            config,
            log: parts.log,
            telemetry: parts.telemetry,
            outputs: parts.outputs,
            category: parts.category,
            http: parts.http.with_cancellation(parts.cancel.clone()),
            runner: parts.runner,
            cancel: parts.cancel,
            env: parts.env,
            workdir: parts.workdir,
            correlation_id: parts.correlation_id,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// The configuration as the step's typed record.
    pub fn options<T: DeserializeOwned>(&self) -> StepResult<T> {
        self.config.typed().map_err(StepError::from)
    }

    pub fn step_name(&self) -> &str {
        self.config.step()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// Read access to values earlier steps persisted.
    pub fn pipeline_environment(&self) -> &PipelineEnvironment {
        &self.env
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail early with [`StepError::Aborted`] once the run is cancelled.
    pub fn check_cancelled(&self) -> StepResult<()> {
        if self.is_cancelled() {
            return Err(StepError::Aborted("run cancelled".to_string()));
        }
        Ok(())
    }

    /// Record a failure category; it applies when the returned error is
    /// unclassified.
    pub fn set_error_category(&self, category: ErrorCategory) {
        self.category.set(category);
    }

    /// Persist `<category>/<name>` to the pipeline environment on exit.
    pub fn set_env(&self, category: &str, name: &str, value: impl Into<Value>) {
        self.outputs.lock().set_env(category, name, value);
    }

    pub fn add_field(&self, measurement: &str, name: &str, value: impl Into<Value>) {
        self.outputs.lock().add_field(measurement, name, value);
    }

    pub fn add_tag(&self, measurement: &str, name: &str, value: impl Into<String>) {
        self.outputs.lock().add_tag(measurement, name, value);
    }

    pub fn add_report(&self, record: ReportRecord) {
        self.outputs.lock().add_report(record);
    }

    pub fn add_link(&self, link: Link) {
        self.outputs.lock().add_link(link);
    }

    /// Free-form telemetry data.
    pub fn set_custom_data(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.outputs.lock().set_custom_data(key.clone(), value.clone());
        self.telemetry.set_custom_data(key, value);
    }

    pub fn set_custom_telemetry(&self, label: impl Into<String>, value: impl Into<String>) {
        self.telemetry.set_custom(label, value);
    }
}
