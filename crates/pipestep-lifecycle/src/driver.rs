//! The lifecycle driver: PRE-RUN, RUN, FINALIZE.
//!
//! One [`StepDriver::run`] call is one step invocation. PRE-RUN wires the
//! log sink, loads configuration and hook settings, builds the backends
//! and resolves parameters. RUN spawns the body and races it against
//! cancellation. FINALIZE always runs, through the [`Finalizer`](crate::Finalizer) assembled
//! along the way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipestep_config::types::Section;
use pipestep_config::{
    ConfigBuilder, CredentialStore, DEFAULT_PREFIX, DEFAULT_PROJECT_CONFIG, EnvCredentialStore,
    EnvSnapshot, HookConfig, RemoteStore, RemoteStoreSlot, SecretFiles, SecretProvider,
    VaultSettings, load_config,
};
use pipestep_exec::{CommandRunner, DEFAULT_GRACE_PERIOD, HttpClient};
use pipestep_log::{CollectorHook, FatalHook, LogCollector, LogFormat, LogSink, RemoteSinkHook};
use pipestep_report::{BucketUploader, GcsUploader, PipelineEnvironment};
use pipestep_telemetry::{
    EventPublisher, HttpTelemetrySink, LogForwarder, PubSubPublisher, PubSubSettings,
    SplunkForwarder, SplunkSettings, TelemetryHandle, TelemetryRecord, TelemetrySink,
    commit_hash_vars,
};
use pipestep_types::{StepError, StepResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{CategoryCell, ContextParts, SharedOutputs, StepContext};
use crate::finalizer::{FinalizerBuilder, RunOutcome, RunState};
use crate::registry::StepEntry;

/// Default pipeline environment root, relative to the working directory.
pub const DEFAULT_ENV_ROOT: &str = ".pipeline/commonPipelineEnvironment";

/// Extra time granted after the grace period for the body to unwind.
const CANCEL_MARGIN: Duration = Duration::from_secs(1);

/// Per-invocation settings, normally taken from global flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Prefix of recognized environment variables.
    pub prefix: String,
    pub verbose: bool,
    /// Generated when absent.
    pub correlation_id: Option<String>,
    pub stage_name: Option<String>,
    pub env_root: Option<PathBuf>,
    pub workdir: PathBuf,
    /// Project file; `.pipeline/config.yml` below the workdir when absent.
    pub custom_config: Option<PathBuf>,
    pub default_configs: Vec<PathBuf>,
    pub log_format: Option<String>,
    pub no_telemetry: bool,
    /// Time between SIGTERM and SIGKILL for child processes.
    pub grace_period: Duration,
    /// Cancel the run after this long.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            verbose: false,
            correlation_id: None,
            stage_name: None,
            env_root: None,
            workdir: PathBuf::from("."),
            custom_config: None,
            default_configs: Vec::new(),
            log_format: None,
            no_telemetry: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    fn env_root(&self) -> PathBuf {
        match &self.env_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => self.workdir.join(root),
            None => self.workdir.join(DEFAULT_ENV_ROOT),
        }
    }

    fn project_config(&self) -> PathBuf {
        self.custom_config
            .clone()
            .unwrap_or_else(|| self.workdir.join(DEFAULT_PROJECT_CONFIG))
    }
}

/// Backends supplied by the caller instead of being built from hook
/// settings.
#[derive(Clone, Default)]
pub struct Services {
    /// Process environment; read from the process when absent.
    pub env: Option<EnvSnapshot>,
    /// Installed log sink; a fresh, uninstalled one when absent.
    pub log: Option<LogSink>,
    pub http: Option<HttpClient>,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    pub remote_store: Option<Arc<dyn RemoteStore>>,
    pub telemetry_sink: Option<Arc<dyn TelemetrySink>>,
    pub forwarder: Option<Arc<dyn LogForwarder>>,
    pub events: Option<Arc<dyn EventPublisher>>,
    pub uploader: Option<(Arc<dyn BucketUploader>, String)>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("log", &self.log.is_some())
            .field("credentials", &self.credentials.is_some())
            .field("remote_store", &self.remote_store.is_some())
            .field("telemetry_sink", &self.telemetry_sink.is_some())
            .field("forwarder", &self.forwarder.is_some())
            .field("events", &self.events.is_some())
            .field("uploader", &self.uploader.is_some())
            .finish()
    }
}

/// Drives one step invocation.
#[derive(Debug, Clone, Default)]
pub struct StepDriver {
    options: RunOptions,
    services: Services,
}

impl StepDriver {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            services: Services::default(),
        }
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `entry` with command-line `flags`. Never fails; failures are
    /// reported in the outcome.
    pub async fn run(&self, entry: &StepEntry, flags: Section) -> RunOutcome {
        self.run_parsed(entry, Ok(flags)).await
    }

    /// Like [`run`](Self::run), for flags that may have failed to parse.
    /// A flag error fails PRE-RUN right before parameter resolution, after
    /// the finalizer backends are in place.
    pub async fn run_parsed(&self, entry: &StepEntry, flags: StepResult<Section>) -> RunOutcome {
        let started = Instant::now();
        let metadata = entry.metadata.clone();
        let env = self.services.env.clone().unwrap_or_else(EnvSnapshot::from_process);
        let log = self.services.log.clone().unwrap_or_default();
        let correlation_id = self
            .options
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        log.set_step_name(metadata.name.as_str());
        log.set_correlation_id(correlation_id.as_str());
        log.set_verbose(self.options.verbose);
        log.set_format(LogFormat::detect(self.options.log_format.as_deref()));
        log.set_error_patterns(&metadata.errors);

        let commit_hash = commit_hash_vars(&self.options.prefix)
            .iter()
            .find_map(|var| env.get(var).filter(|v| !v.is_empty()).map(str::to_string))
            .unwrap_or_default();
        let state = RunState {
            outputs: SharedOutputs::default(),
            log: log.clone(),
            telemetry: TelemetryHandle::new(
                TelemetryRecord::new(metadata.name.as_str())
                    .with_correlation_id(correlation_id.as_str())
                    .with_commit_hash(commit_hash),
            ),
            category: CategoryCell::default(),
        };

        let pipeline_env = PipelineEnvironment::new(self.options.env_root());
        let secret_files = Arc::new(SecretFiles::new());
        let mut builder = FinalizerBuilder::new(
            metadata.clone(),
            pipeline_env.clone(),
            self.options.workdir.clone(),
            state.clone(),
            started,
        );
        builder
            .set_secret_files(secret_files.clone())
            .set_telemetry_enabled(!self.options.no_telemetry);

        let collector = LogCollector::new();
        log.register_hook(Arc::new(FatalHook::new(
            correlation_id.as_str(),
            self.options.workdir.clone(),
        )));
        log.register_hook(Arc::new(CollectorHook::new(collector.clone())));
        builder.set_collector(collector);
        self.apply_service_overrides(&mut builder);

        tracing::debug!(
            step = %metadata.name,
            correlation_id = %correlation_id,
            "Starting step"
        );

        let prepared = self
            .prepare(entry, flags, &env, &state, &pipeline_env, secret_files, correlation_id, &mut builder)
            .await;
        let result = match prepared {
            Ok(context) => self.execute(entry, context).await,
            Err(e) => Err(e),
        };

        builder.build().finalize(result).await
    }

    fn apply_service_overrides(&self, builder: &mut FinalizerBuilder) {
        let services = &self.services;
        if let Some(sink) = &services.telemetry_sink {
            builder.set_telemetry_sink(sink.clone());
        }
        if let Some(forwarder) = &services.forwarder {
            builder.set_forwarder(forwarder.clone());
        }
        if let Some(events) = &services.events {
            builder.set_events(events.clone());
        }
        if let Some((uploader, folder)) = &services.uploader {
            builder.set_uploader(uploader.clone(), folder.as_str());
        }
    }

    /// PRE-RUN. Backends are handed to `builder` as soon as they exist, so
    /// that a failure later on still finalizes with them.
    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        &self,
        entry: &StepEntry,
        flags: StepResult<Section>,
        env: &EnvSnapshot,
        state: &RunState,
        pipeline_env: &PipelineEnvironment,
        secret_files: Arc<SecretFiles>,
        correlation_id: String,
        builder: &mut FinalizerBuilder,
    ) -> StepResult<StepContext> {
        let options = &self.options;
        let log = &state.log;
        let metadata = &entry.metadata;

        let loaded = load_config(&options.project_config(), &options.default_configs)?;
        tracing::debug!(files = loaded.sources.len(), "Configuration files loaded");

        let mut hooks = loaded.project.hooks.clone();
        hooks.apply_env(env, &options.prefix);
        hooks.validate()?;
        for secret in hooks.secrets() {
            log.register_secret(secret);
        }

        let http = match &self.services.http {
            Some(http) => http.clone(),
            None => HttpClient::builder()
                .user_agent(concat!("pipestep/", env!("CARGO_PKG_VERSION")))
                .build()?,
        };
        let remote = self.register_backends(&hooks, &http, env, log, &correlation_id, builder)?;

        let credentials = self.services.credentials.clone().unwrap_or_else(|| {
            Arc::new(EnvCredentialStore::new(env.clone(), options.prefix.as_str()))
        });
        let provider = SecretProvider::new(credentials, env.clone(), log.secrets().clone())
            .with_remote(remote)
            .with_files(secret_files);

        let flags = flags?;
        let config = ConfigBuilder::new(metadata)
            .prefix(options.prefix.as_str())
            .env(env.clone())
            .loaded(loaded)
            .stage(options.stage_name.clone())
            .flags(flags)
            .pipeline_environment(pipeline_env.clone())
            .resolve(&provider)
            .await?;

        if !config.telemetry_enabled() {
            tracing::debug!("Telemetry collection disabled by configuration");
            builder.set_telemetry_enabled(false);
        }

        let runner = CommandRunner::new(options.cancel.clone()).with_grace_period(options.grace_period);
        Ok(StepContext::new(
            config,
            ContextParts {
                log: log.clone(),
                telemetry: state.telemetry.clone(),
                outputs: state.outputs.clone(),
                category: state.category.clone(),
                cancel: options.cancel.clone(),
                http,
                runner,
                env: pipeline_env.clone(),
                workdir: options.workdir.clone(),
                correlation_id,
            },
        ))
    }

    /// Optional log hooks and finalizer backends from hook settings.
    /// Returns the remote store slot used for secret resolution.
    fn register_backends(
        &self,
        hooks: &HookConfig,
        http: &HttpClient,
        env: &EnvSnapshot,
        log: &LogSink,
        correlation_id: &str,
        builder: &mut FinalizerBuilder,
    ) -> StepResult<Arc<RemoteStoreSlot>> {
        let services = &self.services;

        if let Some(dsn) = &hooks.sentry.dsn {
            let hook = Arc::new(RemoteSinkHook::spawn(dsn, correlation_id)?);
            log.register_hook(hook.clone());
            builder.set_remote_sink(hook);
        }

        if services.telemetry_sink.is_none() {
            if let Some(endpoint) = &hooks.telemetry.endpoint {
                let sink = HttpTelemetrySink::new(http.clone(), endpoint)?;
                builder.set_telemetry_sink(Arc::new(sink));
            }
        }

        if services.forwarder.is_none() {
            if let Some(dsn) = &hooks.splunk.dsn {
                let forwarder = SplunkForwarder::new(
                    http.clone(),
                    SplunkSettings {
                        dsn: dsn.clone(),
                        token: hooks.splunk.token.clone().unwrap_or_default(),
                        index: hooks.splunk.index.clone().unwrap_or_default(),
                        send_logs: hooks.splunk.send_logs,
                        host: env.get("HOSTNAME").unwrap_or("unknown").to_string(),
                    },
                )?;
                builder.set_forwarder(Arc::new(forwarder));
            }
        }

        if services.events.is_none() && hooks.pubsub.enabled {
            let publisher = PubSubPublisher::new(
                http.clone(),
                PubSubSettings {
                    endpoint: hooks
                        .pubsub
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| pipestep_config::PubSubHook::DEFAULT_ENDPOINT.to_string()),
                    project_id: hooks.pubsub.project_id.clone().unwrap_or_default(),
                    topic: hooks.pubsub.topic.clone().unwrap_or_default(),
                    token: hooks.pubsub.token.clone(),
                },
            )?;
            builder.set_events(Arc::new(publisher));
        }

        if services.uploader.is_none() {
            if let Some(bucket) = &hooks.bucket.name {
                let mut bucket_http = HttpClient::builder();
                if let Some(token) = &hooks.bucket.token {
                    bucket_http = bucket_http.bearer_token(token.as_str());
                }
                let uploader = GcsUploader::new(
                    bucket_http.build()?,
                    hooks
                        .bucket
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| GcsUploader::DEFAULT_ENDPOINT.to_string()),
                    bucket.as_str(),
                );
                let folder = hooks.bucket.folder.clone().unwrap_or_default();
                builder.set_uploader(Arc::new(uploader), folder);
            }
        }

        let remote = Arc::new(match &services.remote_store {
            Some(store) => RemoteStoreSlot::ready(store.clone()),
            None => RemoteStoreSlot::from_settings(VaultSettings::from_hook(&hooks.vault)),
        });
        builder.set_remote_store(remote.clone());
        Ok(remote)
    }

    /// RUN. The body runs on its own task so a panic is contained.
    async fn execute(&self, entry: &StepEntry, context: StepContext) -> StepResult<()> {
        let cancel = self.options.cancel.clone();
        let body = entry.body.clone();
        let mut handle = tokio::spawn(async move { body.run(context).await });

        let deadline = async {
            match self.options.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };

        let reason = tokio::select! {
            joined = &mut handle => return join_result(joined),
            _ = cancel.cancelled() => "Run cancelled; waiting for the step to stop",
            _ = deadline => {
                cancel.cancel();
                "Run deadline reached; cancelling"
            }
        };
        tracing::warn!("{}", reason);
        self.wait_after_cancel(handle).await
    }

    async fn wait_after_cancel(&self, mut handle: JoinHandle<StepResult<()>>) -> StepResult<()> {
        let grace = self.options.grace_period;
        match tokio::time::timeout(grace + CANCEL_MARGIN, &mut handle).await {
            Ok(joined) => match join_result(joined) {
                Ok(()) => Err(StepError::Aborted("run cancelled".to_string())),
                Err(e) => Err(e),
            },
            Err(_) => {
                handle.abort();
                Err(StepError::Aborted(format!(
                    "step did not stop within {}ms of cancellation",
                    grace.as_millis()
                )))
            }
        }
    }
}

/// Run `entry` once with `options` and default services.
pub async fn run_step(entry: &StepEntry, flags: Section, options: RunOptions) -> RunOutcome {
    StepDriver::new(options).run(entry, flags).await
}

fn join_result(joined: Result<StepResult<()>, tokio::task::JoinError>) -> StepResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StepError::Panic(message))
        }
        Err(_) => Err(StepError::Aborted("step task was cancelled".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_root_is_relative_to_workdir() {
        let options = RunOptions {
            workdir: PathBuf::from("/work"),
            ..Default::default()
        };
        assert_eq!(
            options.env_root(),
            PathBuf::from("/work/.pipeline/commonPipelineEnvironment")
        );

        let options = RunOptions {
            workdir: PathBuf::from("/work"),
            env_root: Some(PathBuf::from("/abs/env")),
            ..Default::default()
        };
        assert_eq!(options.env_root(), PathBuf::from("/abs/env"));
    }

    #[test]
    fn test_project_config_default_path() {
        let options = RunOptions {
            workdir: PathBuf::from("/work"),
            ..Default::default()
        };
        assert_eq!(options.project_config(), PathBuf::from("/work/.pipeline/config.yml"));
    }

    #[tokio::test]
    async fn test_panic_payload_becomes_message() {
        let joined = tokio::spawn(async {
            if true {
                panic!("boom");
            }
            StepResult::Ok(())
        })
        .await;
        let err = join_result(joined).unwrap_err();
        assert!(matches!(err, StepError::Panic(m) if m == "boom"));

        let joined = tokio::spawn(async {
            let n = 3;
            if n > 0 {
                panic!("formatted {}", n);
            }
            StepResult::Ok(())
        })
        .await;
        let err = join_result(joined).unwrap_err();
        assert!(matches!(err, StepError::Panic(m) if m == "formatted 3"));
    }
}
