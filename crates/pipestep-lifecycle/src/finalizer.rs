//! The end-of-run finalizer.
//!
//! Built incrementally during PRE-RUN and consumed exactly once, whatever
//! the outcome of the run. Phases always run in this order:
//!
//! 1. persist pipeline environment outputs and measurements
//! 2. publish reports (manifest, bucket upload)
//! 3. remove secret files
//! 4. fill the telemetry record
//! 5. send telemetry
//! 6. forward logs
//! 7. publish the end-of-run event
//! 8. revoke the remote store token
//! 9. log the terminal line
//!
//! Phases 5 through 8 report their own failures and never stop later ones.
//! When the finalizer is dropped before [`Finalizer::finalize`] got past
//! phase 3, `Drop` runs whatever is left of phases 1 to 3.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipestep_config::{RemoteStoreSlot, SecretFiles};
use pipestep_log::{LogCollector, LogSink, RemoteSinkHook, fatal};
use pipestep_report::{
    BucketUploader, PipelineEnvironment, ReportPublisher, persist_environment, write_manifest,
};
use pipestep_telemetry::{
    CloudEvent, EventPublisher, LogForwarder, NoopTelemetrySink, TelemetryHandle, TelemetryRecord,
    TelemetrySink,
};
use pipestep_types::{ErrorCategory, StepError, StepMetadata, StepResult};

use crate::context::{CategoryCell, SharedOutputs};

const REMOTE_SINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One finalizer phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    PersistEnvironment,
    PublishReports,
    RemoveSecretFiles,
    FillTelemetry,
    SendTelemetry,
    ForwardLogs,
    PublishEvent,
    CloseRemoteStore,
    Report,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::PersistEnvironment,
        Phase::PublishReports,
        Phase::RemoveSecretFiles,
        Phase::FillTelemetry,
        Phase::SendTelemetry,
        Phase::ForwardLogs,
        Phase::PublishEvent,
        Phase::CloseRemoteStore,
        Phase::Report,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::PersistEnvironment => "persist environment",
            Phase::PublishReports => "publish reports",
            Phase::RemoveSecretFiles => "remove secret files",
            Phase::FillTelemetry => "fill telemetry",
            Phase::SendTelemetry => "send telemetry",
            Phase::ForwardLogs => "forward logs",
            Phase::PublishEvent => "publish event",
            Phase::CloseRemoteStore => "close remote store",
            Phase::Report => "report",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Done,
    /// Nothing to do (backend not configured or disabled).
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Process exit code: 0 on success, 1 on failure.
    pub exit_code: i32,
    /// Telemetry error code, `"0"` or `"1"`.
    pub error_code: String,
    pub category: ErrorCategory,
    pub telemetry: TelemetryRecord,
    /// Rendered (masked) failure message.
    pub error: Option<String>,
    /// Phases in the order they ran.
    pub phases: Vec<PhaseRecord>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn status(&self, phase: Phase) -> Option<&PhaseStatus> {
        self.phases.iter().find(|r| r.phase == phase).map(|r| &r.status)
    }
}

/// Collects the backends the finalizer will drive.
pub struct FinalizerBuilder {
    metadata: Arc<StepMetadata>,
    env: PipelineEnvironment,
    workdir: PathBuf,
    outputs: SharedOutputs,
    log: LogSink,
    telemetry: TelemetryHandle,
    category: CategoryCell,
    started: Instant,
    secret_files: Option<Arc<SecretFiles>>,
    uploader: Option<(Arc<dyn BucketUploader>, String)>,
    collector: LogCollector,
    telemetry_enabled: bool,
    sink: Arc<dyn TelemetrySink>,
    forwarder: Option<Arc<dyn LogForwarder>>,
    events: Option<Arc<dyn EventPublisher>>,
    remote: Option<Arc<RemoteStoreSlot>>,
    remote_sink: Option<Arc<RemoteSinkHook>>,
}

/// Handles shared between the run and the finalizer.
#[derive(Debug, Clone)]
pub struct RunState {
    pub outputs: SharedOutputs,
    pub log: LogSink,
    pub telemetry: TelemetryHandle,
    pub category: CategoryCell,
}

impl FinalizerBuilder {
    /// Start at the beginning of PRE-RUN; `started` is the run's start time.
    pub fn new(
        metadata: Arc<StepMetadata>,
        env: PipelineEnvironment,
        workdir: impl Into<PathBuf>,
        state: RunState,
        started: Instant,
    ) -> Self {
        Self {
            metadata,
            env,
            workdir: workdir.into(),
            outputs: state.outputs,
            log: state.log,
            telemetry: state.telemetry,
            category: state.category,
            started,
            secret_files: None,
            uploader: None,
            collector: LogCollector::new(),
            telemetry_enabled: true,
            sink: Arc::new(NoopTelemetrySink),
            forwarder: None,
            events: None,
            remote: None,
            remote_sink: None,
        }
    }

    pub fn set_secret_files(&mut self, files: Arc<SecretFiles>) -> &mut Self {
        self.secret_files = Some(files);
        self
    }

    pub fn set_uploader(&mut self, uploader: Arc<dyn BucketUploader>, folder: impl Into<String>) -> &mut Self {
        self.uploader = Some((uploader, folder.into()));
        self
    }

    pub fn set_collector(&mut self, collector: LogCollector) -> &mut Self {
        self.collector = collector;
        self
    }

    pub fn set_telemetry_sink(&mut self, sink: Arc<dyn TelemetrySink>) -> &mut Self {
        self.sink = sink;
        self
    }

    /// Whether phase 5 sends the record. The record is filled regardless.
    pub fn set_telemetry_enabled(&mut self, enabled: bool) -> &mut Self {
        self.telemetry_enabled = enabled;
        self
    }

    pub fn set_forwarder(&mut self, forwarder: Arc<dyn LogForwarder>) -> &mut Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn set_events(&mut self, events: Arc<dyn EventPublisher>) -> &mut Self {
        self.events = Some(events);
        self
    }

    pub fn set_remote_store(&mut self, remote: Arc<RemoteStoreSlot>) -> &mut Self {
        self.remote = Some(remote);
        self
    }

    pub fn set_remote_sink(&mut self, hook: Arc<RemoteSinkHook>) -> &mut Self {
        self.remote_sink = Some(hook);
        self
    }

    pub fn build(self) -> Finalizer {
        let mut publisher = ReportPublisher::new(self.env.clone(), self.workdir);
        if let Some((uploader, folder)) = self.uploader {
            publisher = publisher.with_uploader(uploader, folder);
        }
        Finalizer {
            metadata: self.metadata,
            env: self.env,
            outputs: self.outputs,
            log: self.log,
            telemetry: self.telemetry,
            category: self.category,
            started: self.started,
            secret_files: self.secret_files,
            publisher,
            collector: self.collector,
            telemetry_enabled: self.telemetry_enabled,
            sink: self.sink,
            forwarder: self.forwarder,
            events: self.events,
            remote: self.remote,
            remote_sink: self.remote_sink,
            progress: SyncProgress::default(),
        }
    }
}

/// Which of the synchronous phases have run.
#[derive(Debug, Default, Clone, Copy)]
struct SyncProgress {
    environment: bool,
    reports: bool,
    secret_files: bool,
}

/// Runs the end-of-run phases. Consumed by [`finalize`](Self::finalize).
pub struct Finalizer {
    metadata: Arc<StepMetadata>,
    env: PipelineEnvironment,
    outputs: SharedOutputs,
    log: LogSink,
    telemetry: TelemetryHandle,
    category: CategoryCell,
    started: Instant,
    secret_files: Option<Arc<SecretFiles>>,
    publisher: ReportPublisher,
    collector: LogCollector,
    telemetry_enabled: bool,
    sink: Arc<dyn TelemetrySink>,
    forwarder: Option<Arc<dyn LogForwarder>>,
    events: Option<Arc<dyn EventPublisher>>,
    remote: Option<Arc<RemoteStoreSlot>>,
    remote_sink: Option<Arc<RemoteSinkHook>>,
    progress: SyncProgress,
}

impl Finalizer {
    /// The category reported for a failed run.
    ///
    /// A classified error wins; otherwise the category the body recorded,
    /// then one matched from the step's error patterns.
    fn category_for(&self, error: &StepError) -> ErrorCategory {
        let category = error.category();
        if !category.is_undefined() {
            return category;
        }
        self.category
            .get()
            .or_else(|| self.log.matched_category())
            .unwrap_or(ErrorCategory::Undefined)
    }

    /// Run every phase and produce the outcome.
    pub async fn finalize(mut self, result: StepResult<()>) -> RunOutcome {
        let mut phases = Vec::with_capacity(Phase::ALL.len());
        let mut error = result.err();

        if let Some(err) = &error {
            let category = self.category_for(err);
            fatal!(category = %category, error = %err, "Step failed");
        }

        // 1
        let status = self.persist_environment();
        if let PhaseStatus::Failed(message) = &status {
            error.get_or_insert_with(|| StepError::Infrastructure(message.clone()));
        }
        phases.push(record(Phase::PersistEnvironment, status));

        // 2
        let status = self.publish_reports().await;
        if let PhaseStatus::Failed(message) = &status {
            error.get_or_insert_with(|| StepError::Infrastructure(message.clone()));
        }
        phases.push(record(Phase::PublishReports, status));

        // 3
        phases.push(record(Phase::RemoveSecretFiles, self.remove_secret_files()));

        // 4
        let failed = error.is_some();
        let category = match &error {
            Some(err) => self.category_for(err),
            None => ErrorCategory::Undefined,
        };
        self.telemetry.fill(self.started.elapsed(), failed, category);
        let telemetry = self.telemetry.snapshot();
        phases.push(record(Phase::FillTelemetry, PhaseStatus::Done));

        // 5
        let status = if !self.telemetry_enabled {
            tracing::debug!("Telemetry disabled; record not sent");
            PhaseStatus::Skipped
        } else {
            match self.sink.send(&telemetry).await {
                Ok(()) => PhaseStatus::Done,
                Err(e) => warn_failed(Phase::SendTelemetry, e),
            }
        };
        phases.push(record(Phase::SendTelemetry, status));

        // 6
        let status = match &self.forwarder {
            Some(forwarder) => match forwarder.forward(&telemetry, &self.collector.entries()).await {
                Ok(posts) => {
                    tracing::debug!(posts, "Logs forwarded");
                    PhaseStatus::Done
                }
                Err(e) => warn_failed(Phase::ForwardLogs, e),
            },
            None => PhaseStatus::Skipped,
        };
        phases.push(record(Phase::ForwardLogs, status));

        // 7
        let status = match &self.events {
            Some(events) => match CloudEvent::step_finished(&telemetry) {
                Ok(event) => match events.publish(&event).await {
                    Ok(id) => {
                        tracing::debug!(message_id = ?id, "Event published");
                        PhaseStatus::Done
                    }
                    Err(e) => warn_failed(Phase::PublishEvent, e),
                },
                Err(e) => warn_failed(Phase::PublishEvent, e),
            },
            None => PhaseStatus::Skipped,
        };
        phases.push(record(Phase::PublishEvent, status));

        // 8
        let status = match &self.remote {
            Some(remote) => match remote.revoke().await {
                Ok(true) => PhaseStatus::Done,
                Ok(false) => PhaseStatus::Skipped,
                Err(e) => warn_failed(Phase::CloseRemoteStore, e),
            },
            None => PhaseStatus::Skipped,
        };
        phases.push(record(Phase::CloseRemoteStore, status));

        // 9
        let message = error.as_ref().map(|e| self.log.secrets().mask(&e.to_string()));
        match &message {
            None => tracing::info!("SUCCESS"),
            Some(message) => tracing::error!(category = %category, "{}", message),
        }
        phases.push(record(Phase::Report, PhaseStatus::Done));

        if let Some(hook) = &self.remote_sink {
            hook.flush(REMOTE_SINK_FLUSH_TIMEOUT).await;
        }

        RunOutcome {
            exit_code: i32::from(failed),
            error_code: telemetry.error_code.clone(),
            category,
            telemetry,
            error: message,
            phases,
        }
    }

    fn persist_environment(&mut self) -> PhaseStatus {
        self.progress.environment = true;
        let outputs = self.outputs.lock().clone();
        let summary = persist_environment(&self.env, &self.metadata, &outputs);
        if summary.is_success() {
            PhaseStatus::Done
        } else {
            PhaseStatus::Failed(format!(
                "{} pipeline environment value(s) could not be written",
                summary.failed
            ))
        }
    }

    async fn publish_reports(&mut self) -> PhaseStatus {
        self.progress.reports = true;
        let outputs = self.outputs.lock().clone();
        let result = self
            .publisher
            .publish(&self.metadata.outputs.reports, outputs.reports(), outputs.links())
            .await;
        match result {
            Ok(summary) if !summary.mandatory_failures.is_empty() => {
                let message = format!(
                    "mandatory report(s) not published: {}",
                    summary.mandatory_failures.join(", ")
                );
                tracing::error!("{}", message);
                PhaseStatus::Failed(message)
            }
            Ok(_) => PhaseStatus::Done,
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist reports");
                PhaseStatus::Failed(e.to_string())
            }
        }
    }

    fn remove_secret_files(&mut self) -> PhaseStatus {
        self.progress.secret_files = true;
        match &self.secret_files {
            Some(files) => {
                let removed = files.remove_all();
                tracing::debug!(removed, "Secret files removed");
                PhaseStatus::Done
            }
            None => PhaseStatus::Skipped,
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        let progress = self.progress;
        if !progress.environment {
            self.persist_environment();
        }
        if !progress.reports {
            self.progress.reports = true;
            let outputs = self.outputs.lock().clone();
            if let Err(e) = write_manifest(&self.env, outputs.reports(), outputs.links()) {
                tracing::error!(error = %e, "Failed to persist reports");
            }
        }
        if !progress.secret_files {
            self.remove_secret_files();
        }
    }
}

fn record(phase: Phase, status: PhaseStatus) -> PhaseRecord {
    PhaseRecord { phase, status }
}

fn warn_failed(phase: Phase, err: impl std::fmt::Display) -> PhaseStatus {
    tracing::warn!(phase = %phase, error = %err, "Finalizer phase failed");
    PhaseStatus::Failed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pipestep_log::SharedBuffer;
    use pipestep_report::ReportRecord;
    use pipestep_telemetry::TelemetryError;
    use tempfile::TempDir;

    const META: &str = r#"
name: demo
outputs:
  environment:
    - category: greeting
      name: text
"#;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<TelemetryRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, record: &TelemetryRecord) -> pipestep_telemetry::Result<()> {
            self.sent.lock().push(record.clone());
            if self.fail {
                return Err(TelemetryError::InvalidConfig {
                    sink: "recording",
                    message: "backend down".to_string(),
                });
            }
            Ok(())
        }
    }

    fn state() -> RunState {
        RunState {
            outputs: SharedOutputs::default(),
            log: LogSink::with_writer(SharedBuffer::new()),
            telemetry: TelemetryHandle::new(TelemetryRecord::new("demo")),
            category: CategoryCell::default(),
        }
    }

    fn builder(dir: &TempDir, state: &RunState) -> FinalizerBuilder {
        let metadata = Arc::new(StepMetadata::from_yaml(META).unwrap());
        FinalizerBuilder::new(
            metadata,
            PipelineEnvironment::new(dir.path().join("env")),
            dir.path(),
            state.clone(),
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_success_runs_every_phase_in_order() {
        let dir = TempDir::new().unwrap();
        let state = state();
        state.outputs.lock().set_env("greeting", "text", "hi");
        let sink = Arc::new(RecordingSink::default());

        let mut builder = builder(&dir, &state);
        builder.set_telemetry_sink(sink.clone());
        let outcome = builder.build().finalize(Ok(())).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.error_code, "0");
        assert_eq!(outcome.category, ErrorCategory::Undefined);
        let order: Vec<Phase> = outcome.phases.iter().map(|r| r.phase).collect();
        assert_eq!(order, Phase::ALL.to_vec());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("env/greeting/text")).unwrap(),
            "hi"
        );
        assert_eq!(sink.sent.lock().len(), 1);
        assert_eq!(outcome.status(Phase::ForwardLogs), Some(&PhaseStatus::Skipped));
    }

    #[tokio::test]
    async fn test_explicit_category_beats_undefined_error() {
        let dir = TempDir::new().unwrap();
        let state = state();
        state.category.set(ErrorCategory::Compliance);

        let outcome = builder(&dir, &state)
            .build()
            .finalize(Err(StepError::Other(anyhow::anyhow!("threshold exceeded"))))
            .await;

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.category, ErrorCategory::Compliance);
        assert_eq!(outcome.telemetry.error_category, "compliance");
    }

    #[tokio::test]
    async fn test_classified_error_beats_explicit_category() {
        let dir = TempDir::new().unwrap();
        let state = state();
        state.category.set(ErrorCategory::Custom);

        let outcome = builder(&dir, &state)
            .build()
            .finalize(Err(StepError::ExternalTool {
                tool: "mvn".to_string(),
                code: 2,
            }))
            .await;
        assert_eq!(outcome.category, ErrorCategory::ExternalTool);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_later_phases() {
        let dir = TempDir::new().unwrap();
        let state = state();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });

        let mut builder = builder(&dir, &state);
        builder.set_telemetry_sink(sink);
        let outcome = builder.build().finalize(Ok(())).await;

        assert!(outcome.is_success());
        assert!(matches!(
            outcome.status(Phase::SendTelemetry),
            Some(PhaseStatus::Failed(_))
        ));
        assert_eq!(outcome.phases.last().map(|r| r.phase), Some(Phase::Report));
    }

    #[tokio::test]
    async fn test_disabled_telemetry_is_filled_but_not_sent() {
        let dir = TempDir::new().unwrap();
        let state = state();
        let sink = Arc::new(RecordingSink::default());

        let mut builder = builder(&dir, &state);
        builder.set_telemetry_sink(sink.clone()).set_telemetry_enabled(false);
        let outcome = builder.build().finalize(Ok(())).await;

        assert!(sink.sent.lock().is_empty());
        assert_eq!(outcome.status(Phase::SendTelemetry), Some(&PhaseStatus::Skipped));
        assert!(outcome.telemetry.duration_ms().is_some());
    }

    #[tokio::test]
    async fn test_missing_mandatory_report_fails_successful_run() {
        let dir = TempDir::new().unwrap();
        let state = state();
        state
            .outputs
            .lock()
            .add_report(ReportRecord::new("target/missing.xml").mandatory());

        let outcome = builder(&dir, &state).build().finalize(Ok(())).await;

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.category, ErrorCategory::Infrastructure);
        assert!(outcome.error.unwrap().contains("target/missing.xml"));
    }

    #[test]
    fn test_drop_runs_synchronous_phases() {
        let dir = TempDir::new().unwrap();
        let state = state();
        let files = Arc::new(SecretFiles::in_dir(dir.path().join("secrets")));
        let secret = files.write("kubeconfig", "data").unwrap();
        state.outputs.lock().set_env("greeting", "text", "hi");

        let mut builder = builder(&dir, &state);
        builder.set_secret_files(files);
        drop(builder.build());

        assert!(dir.path().join("env/greeting/text").exists());
        assert!(!secret.exists());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::CloseRemoteStore.to_string(), "close remote store");
        assert_eq!(Phase::ALL.len(), 9);
    }
}
