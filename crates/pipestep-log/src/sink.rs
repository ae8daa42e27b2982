//! The log sink handle shared by the driver and step bodies.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use pipestep_types::{ErrorCategory, ErrorPattern};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::{
    ErrorPatternMatcher, LogEntry, LogError, LogFormat, LogHook, LogLevel, Result, SecretMask,
    StepLogLayer,
};

/// Keeps chatty dependency crates out of step output.
const DEPENDENCY_FILTER: &str =
    "debug,hyper=warn,hyper_util=warn,h2=warn,reqwest=warn,rustls=warn,tower=warn";

struct SinkInner {
    mask: SecretMask,
    hooks: RwLock<Vec<Arc<dyn LogHook>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    format: RwLock<LogFormat>,
    step_name: RwLock<String>,
    correlation_id: RwLock<String>,
    verbose: AtomicBool,
    patterns: RwLock<ErrorPatternMatcher>,
    matched_category: Mutex<Option<ErrorCategory>>,
}

/// Cloneable handle to the per-process log sink.
///
/// Clones share secrets, hooks and output.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// A sink writing to stderr.
    pub fn new() -> Self {
        Self::with_writer(std::io::stderr())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                mask: SecretMask::new(),
                hooks: RwLock::new(Vec::new()),
                writer: Mutex::new(Box::new(writer)),
                format: RwLock::new(LogFormat::Default),
                step_name: RwLock::new(String::new()),
                correlation_id: RwLock::new(String::new()),
                verbose: AtomicBool::new(false),
                patterns: RwLock::new(ErrorPatternMatcher::default()),
                matched_category: Mutex::new(None),
            }),
        }
    }

    pub fn set_format(&self, format: LogFormat) {
        *self.inner.format.write() = format;
    }

    pub fn set_step_name(&self, step_name: impl Into<String>) {
        *self.inner.step_name.write() = step_name.into();
    }

    pub fn step_name(&self) -> String {
        self.inner.step_name.read().clone()
    }

    pub fn set_correlation_id(&self, correlation_id: impl Into<String>) {
        *self.inner.correlation_id.write() = correlation_id.into();
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::SeqCst);
    }

    pub fn is_verbose(&self) -> bool {
        self.inner.verbose.load(Ordering::SeqCst)
    }

    /// Mask `secret` in every entry emitted from now on.
    pub fn register_secret(&self, secret: &str) {
        self.inner.mask.register(secret);
    }

    pub fn secrets(&self) -> &SecretMask {
        &self.inner.mask
    }

    pub fn register_hook(&self, hook: Arc<dyn LogHook>) {
        self.inner.hooks.write().push(hook);
    }

    pub fn hook_names(&self) -> Vec<&'static str> {
        self.inner.hooks.read().iter().map(|h| h.name()).collect()
    }

    /// Install the error signatures that classify failures from output.
    pub fn set_error_patterns(&self, patterns: &[ErrorPattern]) {
        *self.inner.patterns.write() = ErrorPatternMatcher::new(patterns);
    }

    /// Category recorded by the first matching error pattern.
    pub fn matched_category(&self) -> Option<ErrorCategory> {
        *self.inner.matched_category.lock()
    }

    pub fn layer(&self) -> StepLogLayer {
        StepLogLayer::new(self.clone())
    }

    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::registry()
            .with(self.layer().with_filter(EnvFilter::new(DEPENDENCY_FILTER)))
    }

    /// Install the sink as the process-wide subscriber and panic hook.
    /// Call once at startup.
    pub fn init_global(&self) -> Result<()> {
        tracing::subscriber::set_global_default(self.subscriber())
            .map_err(|e| LogError::Install(e.to_string()))?;
        self.install_panic_hook();
        Ok(())
    }

    /// Replace the default panic hook, which prints the raw payload.
    ///
    /// The driver reports a panicking body as a masked error, so the hook
    /// only adds a masked debug entry with the location in verbose mode.
    pub fn install_panic_hook(&self) {
        let sink = self.clone();
        std::panic::set_hook(Box::new(move |info| {
            if !sink.is_verbose() {
                return;
            }
            let payload = info.payload();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let mut entry = LogEntry::new(LogLevel::Debug, format!("panicked: {}", message));
            if let Some(location) = info.location() {
                entry.fields.push(("location".to_string(), location.to_string()));
            }
            sink.emit(entry);
        }));
    }

    /// Install the sink for the current thread until the guard drops.
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(self.subscriber())
    }

    /// Mask, render and dispatch one entry.
    pub(crate) fn emit(&self, mut entry: LogEntry) {
        entry.step_name = self.step_name();
        entry.correlation_id = self.inner.correlation_id.read().clone();

        let mask = &self.inner.mask;
        if !mask.is_empty() {
            entry.message = mask.mask(&entry.message);
            entry.error = entry.error.as_deref().map(|e| mask.mask(e));
            for (_, value) in entry.fields.iter_mut() {
                *value = mask.mask(value);
            }
        }

        let notice = self.check_patterns(&entry);

        self.write(&entry);
        if let Some(notice) = &notice {
            self.write(notice);
        }

        let hooks = self.inner.hooks.read().clone();
        for hook in hooks {
            hook.on_entry(&entry);
        }
    }

    fn check_patterns(&self, entry: &LogEntry) -> Option<LogEntry> {
        if entry.level < LogLevel::Warn && entry.field("tool").is_none() {
            return None;
        }
        let patterns = self.inner.patterns.read();
        let hit = patterns.find(&entry.message)?;

        if let Some(category) = hit.category {
            self.inner.matched_category.lock().get_or_insert(category);
        }
        if hit.message.is_empty() {
            return None;
        }
        let mut notice = LogEntry::new(LogLevel::Info, format!("💡 {}", hit.message));
        notice.step_name = entry.step_name.clone();
        notice.correlation_id = entry.correlation_id.clone();
        Some(notice)
    }

    fn write(&self, entry: &LogEntry) {
        let line = self.inner.format.read().render(entry);
        let mut writer = self.inner.writer.lock();
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("step_name", &self.step_name())
            .field("secrets", &self.inner.mask.len())
            .field("hooks", &self.hook_names())
            .finish()
    }
}

/// In-memory writer for capturing rendered output.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
