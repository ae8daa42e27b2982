//! End-to-end runs of the lifecycle driver with in-memory backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pipestep_config::types::Section;
use pipestep_config::{CredentialField, EnvSnapshot, RemoteStore, StaticCredentialStore};
use pipestep_exec::CommandSpec;
use pipestep_lifecycle::{
    Phase, PhaseStatus, RunOptions, RunOutcome, Services, StepBody, StepContext, StepDriver,
    StepEntry, typed,
};
use pipestep_log::{LogEntry, LogSink, SharedBuffer};
use pipestep_report::BucketUploader;
use pipestep_telemetry::{CloudEvent, EventPublisher, LogForwarder, TelemetryRecord, TelemetrySink};
use pipestep_types::{ErrorCategory, StepError, StepResult};
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;

type Events = Arc<Mutex<Vec<&'static str>>>;

// ─────────────────────────────────────────────────────────────────────────────
// Recording backends
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    events: Events,
    records: Mutex<Vec<TelemetryRecord>>,
    /// Files whose existence is sampled when the record is sent.
    watch: Mutex<Vec<PathBuf>>,
    observed: Mutex<Vec<bool>>,
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, record: &TelemetryRecord) -> pipestep_telemetry::Result<()> {
        self.events.lock().push("telemetry");
        let observed = self.watch.lock().iter().map(|p| p.exists()).collect();
        *self.observed.lock() = observed;
        self.records.lock().push(record.clone());
        Ok(())
    }
}

struct RecordingForwarder(Events);

#[async_trait]
impl LogForwarder for RecordingForwarder {
    async fn forward(&self, _record: &TelemetryRecord, _entries: &[LogEntry]) -> pipestep_telemetry::Result<usize> {
        self.0.lock().push("forward");
        Ok(1)
    }
}

struct RecordingPublisher(Events);

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, _event: &CloudEvent) -> pipestep_telemetry::Result<Option<String>> {
        self.0.lock().push("event");
        Ok(Some("m-1".to_string()))
    }
}

struct RecordingUploader(Events);

#[async_trait]
impl BucketUploader for RecordingUploader {
    fn bucket(&self) -> &str {
        "reports"
    }

    async fn upload(&self, _object: &str, _path: &Path) -> pipestep_report::Result<()> {
        self.0.lock().push("upload");
        Ok(())
    }
}

struct RecordingStore(Events);

#[async_trait]
impl RemoteStore for RecordingStore {
    async fn read(&self, _path: &str) -> pipestep_config::Result<Option<BTreeMap<String, String>>> {
        Ok(Some(BTreeMap::from([(
            "config".to_string(),
            "apiVersion: v1".to_string(),
        )])))
    }

    async fn revoke(&self) -> pipestep_config::Result<()> {
        self.0.lock().push("revoke");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    dir: TempDir,
    buffer: SharedBuffer,
    log: LogSink,
    events: Events,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new() -> Self {
        let buffer = SharedBuffer::new();
        let events = Events::default();
        Self {
            dir: TempDir::new().unwrap(),
            log: LogSink::with_writer(buffer.clone()),
            buffer,
            sink: Arc::new(RecordingSink {
                events: events.clone(),
                ..Default::default()
            }),
            events,
        }
    }

    fn workdir(&self) -> &Path {
        self.dir.path()
    }

    fn env_root(&self) -> PathBuf {
        self.dir.path().join("env")
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            prefix: "PFX".to_string(),
            correlation_id: Some("corr-1".to_string()),
            workdir: self.workdir().to_path_buf(),
            env_root: Some(self.env_root()),
            ..Default::default()
        }
    }

    fn services(&self) -> Services {
        Services {
            env: Some(EnvSnapshot::new()),
            log: Some(self.log.clone()),
            credentials: Some(Arc::new(StaticCredentialStore::new())),
            telemetry_sink: Some(self.sink.clone()),
            ..Default::default()
        }
    }

    async fn run_with(&self, driver: StepDriver, entry: &StepEntry, flags: Section) -> RunOutcome {
        let _guard = self.log.set_default();
        driver.run(entry, flags).await
    }

    async fn run(&self, entry: &StepEntry, flags: Section) -> RunOutcome {
        let driver = StepDriver::new(self.options()).with_services(self.services());
        self.run_with(driver, entry, flags).await
    }

    fn sent(&self) -> Vec<TelemetryRecord> {
        self.sink.records.lock().clone()
    }
}

fn flags(value: serde_json::Value) -> Section {
    value.as_object().cloned().unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy path and configuration failures
// ─────────────────────────────────────────────────────────────────────────────

const DEMO: &str = r#"
name: demo
parameters:
  - name: name
    type: string
    mandatory: true
    default: world
outputs:
  environment:
    - category: greeting
      name: text
"#;

#[derive(Deserialize)]
struct DemoOptions {
    name: String,
}

fn demo_entry(yaml: &str, invoked: Arc<AtomicBool>) -> StepEntry {
    StepEntry::from_yaml(
        yaml,
        typed(move |options: DemoOptions, ctx: StepContext| {
            let invoked = invoked.clone();
            async move {
                invoked.store(true, Ordering::SeqCst);
                tracing::info!("hello {}", options.name);
                ctx.set_env("greeting", "text", "hi");
                Ok(())
            }
        }),
    )
    .unwrap()
}

#[tokio::test]
async fn test_happy_path() {
    let h = Harness::new();
    let entry = demo_entry(DEMO, Arc::default());

    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.error);
    assert!(h.buffer.contents().contains("hello world"));
    assert_eq!(
        std::fs::read_to_string(h.env_root().join("greeting/text")).unwrap(),
        "hi"
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].error_code, "0");
    assert!(sent[0].duration_ms().unwrap() > 0);
    assert_eq!(sent[0].correlation_id, "corr-1");
    assert!(h.buffer.lines().last().unwrap().contains("SUCCESS"));
}

#[tokio::test]
async fn test_missing_mandatory_skips_body() {
    let h = Harness::new();
    let yaml = DEMO.replace("    default: world\n", "");
    let invoked = Arc::new(AtomicBool::new(false));
    let entry = demo_entry(&yaml, invoked.clone());

    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.exit_code, 1);
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(outcome.category, ErrorCategory::Configuration);
    let sent = h.sent();
    assert_eq!(sent[0].error_code, "1");
    assert_eq!(sent[0].error_category, "configuration");
    let env_empty = std::fs::read_dir(h.env_root())
        .map(|mut d| d.next().is_none())
        .unwrap_or(true);
    assert!(env_empty);
    assert!(h.workdir().join("demo_errorDetails.json").exists());
}

#[tokio::test]
async fn test_rejected_flags_are_finalized() {
    let h = Harness::new();
    let invoked = Arc::new(AtomicBool::new(false));
    let entry = demo_entry(DEMO, invoked.clone());
    let driver = StepDriver::new(h.options()).with_services(h.services());

    let outcome = {
        let _guard = h.log.set_default();
        driver
            .run_parsed(&entry, Err(StepError::configuration("unknown flag '--colour' for step 'demo'")))
            .await
    };

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.category, ErrorCategory::Configuration);
    assert!(!invoked.load(Ordering::SeqCst));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].error_category, "configuration");
    assert!(h.buffer.contents().contains("unknown flag '--colour'"));
    assert!(h.workdir().join("demo_errorDetails.json").exists());
}

#[tokio::test]
async fn test_flag_overrides_environment() {
    let h = Harness::new();
    let yaml = r#"
name: levels
parameters:
  - name: level
    type: string
"#;
    #[derive(Deserialize)]
    struct Options {
        level: Option<String>,
    }
    let seen = Arc::new(Mutex::new(None::<String>));
    let observed = seen.clone();
    let entry = StepEntry::from_yaml(
        yaml,
        typed(move |options: Options, _ctx: StepContext| {
            let observed = observed.clone();
            async move {
                *observed.lock() = options.level;
                Ok(())
            }
        }),
    )
    .unwrap();

    let mut services = h.services();
    services.env = Some(EnvSnapshot::new().with("PFX_level", "info"));
    let driver = StepDriver::new(h.options()).with_services(services);
    let outcome = h
        .run_with(driver, &entry, flags(json!({ "level": "debug" })))
        .await;

    assert!(outcome.is_success());
    assert_eq!(seen.lock().as_deref(), Some("debug"));
}

#[tokio::test]
async fn test_invalid_hook_settings_fail_before_the_body() {
    let h = Harness::new();
    std::fs::create_dir_all(h.workdir().join(".pipeline")).unwrap();
    std::fs::write(
        h.workdir().join(".pipeline/config.yml"),
        "hooks:\n  telemetry:\n    endpoint: not a url\n",
    )
    .unwrap();
    let invoked = Arc::new(AtomicBool::new(false));
    let entry = demo_entry(DEMO, invoked.clone());

    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.category, ErrorCategory::Configuration);
    assert!(!invoked.load(Ordering::SeqCst));
    // The sink supplied by the caller still receives the record.
    assert_eq!(h.sent().len(), 1);
}

#[tokio::test]
async fn test_telemetry_opt_out_from_general_section() {
    let h = Harness::new();
    std::fs::create_dir_all(h.workdir().join(".pipeline")).unwrap();
    std::fs::write(
        h.workdir().join(".pipeline/config.yml"),
        "general:\n  collectTelemetryData: false\n",
    )
    .unwrap();
    let entry = demo_entry(DEMO, Arc::default());

    let outcome = h.run(&entry, Section::new()).await;

    assert!(outcome.is_success());
    assert!(h.sent().is_empty());
    assert_eq!(outcome.status(Phase::SendTelemetry), Some(&PhaseStatus::Skipped));
    assert_eq!(outcome.telemetry.error_code, "0");
}

// ─────────────────────────────────────────────────────────────────────────────
// Secrets
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_secret_is_masked_in_logs_and_telemetry() {
    let h = Harness::new();
    let yaml = r#"
name: tokens
secrets:
  - name: apiCredential
    type: pipeline-credential
parameters:
  - name: token
    type: string
    mandatory: true
    secret: true
    resourceRef:
      - type: pipeline-credential
        name: apiCredential
        param: token
"#;
    #[derive(Deserialize)]
    struct Options {
        token: String,
    }
    let entry = StepEntry::from_yaml(
        yaml,
        typed(|options: Options, ctx: StepContext| async move {
            tracing::info!("using token {} now", options.token);
            ctx.set_custom_data("tokenLength", options.token.len().to_string());
            Ok(())
        }),
    )
    .unwrap();

    let mut services = h.services();
    services.credentials = Some(Arc::new(StaticCredentialStore::new().with(
        "apiCredential",
        CredentialField::Token,
        "s3cr3t",
    )));
    let driver = StepDriver::new(h.options()).with_services(services);
    let outcome = h.run_with(driver, &entry, Section::new()).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    let out = h.buffer.contents();
    assert!(out.contains("using token *** now"));
    assert!(!out.contains("s3cr3t"));
    let record = serde_json::to_string(&h.sent()[0]).unwrap();
    assert!(!record.contains("s3cr3t"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Crashes, errors and cancellation
// ─────────────────────────────────────────────────────────────────────────────

const PARTIAL: &str = r#"
name: partial
outputs:
  environment:
    - category: progress
      name: stage
"#;

struct PanickingBody;

#[async_trait]
impl StepBody for PanickingBody {
    async fn run(&self, ctx: StepContext) -> StepResult<()> {
        ctx.set_env("progress", "stage", "half");
        panic!("boom at half way");
    }
}

#[tokio::test]
async fn test_panicking_body_is_finalized() {
    let h = Harness::new();
    let entry = StepEntry::from_yaml(PARTIAL, PanickingBody).unwrap();

    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(
        std::fs::read_to_string(h.env_root().join("progress/stage")).unwrap(),
        "half"
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].error_code, "1");
    let last = h.buffer.lines().last().cloned().unwrap();
    assert!(last.contains("boom at half way"), "last line: {}", last);
    assert_eq!(outcome.phases.len(), Phase::ALL.len());
}

struct FailingWithPattern;

#[async_trait]
impl StepBody for FailingWithPattern {
    async fn run(&self, _ctx: StepContext) -> StepResult<()> {
        tracing::warn!("request rejected: quota exceeded for project");
        Err(anyhow::anyhow!("deployment failed").into())
    }
}

#[tokio::test]
async fn test_error_pattern_classifies_undefined_failure() {
    let h = Harness::new();
    let yaml = r#"
name: quota
errors:
  - pattern: quota exceeded
    message: Ask for a higher quota.
    category: service
"#;
    let entry = StepEntry::from_yaml(yaml, FailingWithPattern).unwrap();

    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.category, ErrorCategory::Service);
    assert_eq!(h.sent()[0].error_category, "service");
    assert!(h.buffer.contents().contains("Ask for a higher quota."));
}

struct StubbornChild;

#[async_trait]
impl StepBody for StubbornChild {
    async fn run(&self, ctx: StepContext) -> StepResult<()> {
        let spec = CommandSpec::new("sh").args(["-c", "trap '' TERM; sleep 3"]);
        ctx.runner().run_streaming(&spec).await?;
        Ok(())
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancellation_kills_child_and_aborts() {
    let h = Harness::new();
    let entry = StepEntry::from_yaml("name: stubborn\n", StubbornChild).unwrap();
    let options = RunOptions {
        grace_period: Duration::from_secs(2),
        ..h.options()
    };
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let driver = StepDriver::new(options).with_services(h.services());
    let outcome = h.run_with(driver, &entry, Section::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.category, ErrorCategory::Aborted);
    assert!(
        elapsed < Duration::from_millis(300) + Duration::from_secs(2) + Duration::from_millis(1500),
        "took {:?}",
        elapsed
    );
    assert_eq!(h.sent()[0].error_category, "aborted");
}

struct Poller;

#[async_trait]
impl StepBody for Poller {
    async fn run(&self, ctx: StepContext) -> StepResult<()> {
        loop {
            ctx.check_cancelled()?;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn test_deadline_cancels_polling_body() {
    let h = Harness::new();
    let entry = StepEntry::from_yaml("name: poller\n", Poller).unwrap();
    let options = RunOptions {
        deadline: Some(Duration::from_millis(100)),
        ..h.options()
    };

    let driver = StepDriver::new(options).with_services(h.services());
    let outcome = h.run_with(driver, &entry, Section::new()).await;

    assert_eq!(outcome.category, ErrorCategory::Aborted);
    assert_eq!(outcome.exit_code, 1);
}

#[tokio::test]
async fn test_explicit_category_from_body() {
    struct Custom;

    #[async_trait]
    impl StepBody for Custom {
        async fn run(&self, ctx: StepContext) -> StepResult<()> {
            ctx.set_error_category(ErrorCategory::Compliance);
            Err(StepError::Other(anyhow::anyhow!("3 critical findings")))
        }
    }

    let h = Harness::new();
    let entry = StepEntry::from_yaml("name: scan\n", Custom).unwrap();
    let outcome = h.run(&entry, Section::new()).await;

    assert_eq!(outcome.category, ErrorCategory::Compliance);
    assert!(outcome.error.unwrap().contains("3 critical findings"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Finalizer ordering
// ─────────────────────────────────────────────────────────────────────────────

const ORDERED: &str = r#"
name: ordered
secrets:
  - name: kubeConfigSecretName
    type: remote-store
parameters:
  - name: kubeConfig
    type: string
    resourceRef:
      - type: remote-store-file
        name: kubeConfigSecretName
        default: kube
        param: config
outputs:
  environment:
    - category: greeting
      name: text
  reports:
    - filePattern: "reports/*.xml"
      type: junit
      subFolder: tests
"#;

struct Ordered {
    sink: Arc<RecordingSink>,
    env_file: PathBuf,
}

#[async_trait]
impl StepBody for Ordered {
    async fn run(&self, ctx: StepContext) -> StepResult<()> {
        let secret = ctx
            .config()
            .get_str("kubeConfig")
            .ok_or_else(|| StepError::configuration("kubeConfig not resolved"))?;
        assert!(Path::new(secret).exists());
        self.sink
            .watch
            .lock()
            .extend([self.env_file.clone(), PathBuf::from(secret)]);

        let reports = ctx.workdir().join("reports");
        std::fs::create_dir_all(&reports).map_err(|e| StepError::Infrastructure(e.to_string()))?;
        std::fs::write(reports.join("unit.xml"), "<testsuite/>")
            .map_err(|e| StepError::Infrastructure(e.to_string()))?;
        ctx.set_env("greeting", "text", "hi");
        Ok(())
    }
}

#[tokio::test]
async fn test_finalizer_phases_run_in_order() {
    let h = Harness::new();
    std::fs::create_dir_all(h.workdir().join(".pipeline")).unwrap();
    std::fs::write(h.workdir().join(".pipeline/config.yml"), "general:\n  vaultPath: team\n").unwrap();

    let entry = StepEntry::from_yaml(
        ORDERED,
        Ordered {
            sink: h.sink.clone(),
            env_file: h.env_root().join("greeting/text"),
        },
    )
    .unwrap();

    let events = h.events.clone();
    let mut services = h.services();
    services.forwarder = Some(Arc::new(RecordingForwarder(events.clone())));
    services.events = Some(Arc::new(RecordingPublisher(events.clone())));
    services.remote_store = Some(Arc::new(RecordingStore(events.clone())));
    services.uploader = Some((Arc::new(RecordingUploader(events.clone())), "runs".to_string()));

    let driver = StepDriver::new(h.options()).with_services(services);
    let outcome = h.run_with(driver, &entry, Section::new()).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(
        *events.lock(),
        vec!["upload", "telemetry", "forward", "event", "revoke"]
    );
    // Environment written, secret file gone by the time telemetry is sent.
    assert_eq!(*h.sink.observed.lock(), vec![true, false]);

    let order: Vec<Phase> = outcome.phases.iter().map(|r| r.phase).collect();
    assert_eq!(order, Phase::ALL.to_vec());
    assert!(
        outcome
            .phases
            .iter()
            .all(|r| r.status == PhaseStatus::Done),
        "{:?}",
        outcome.phases
    );
}
