//! Writing accumulated outputs to the pipeline environment.

use pipestep_log::fatal;
use pipestep_types::StepMetadata;

use crate::{PipelineEnvironment, StepOutputs};

/// Counts from one persistence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub written: usize,
    /// Outputs the step metadata does not declare.
    pub skipped: usize,
    pub failed: usize,
}

impl PersistSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Persist environment outputs and influx measurements.
///
/// Every write is attempted. Failures are logged and counted, and a single
/// fatal entry follows the last write when any of them failed.
pub fn persist_environment(
    env: &PipelineEnvironment,
    metadata: &StepMetadata,
    outputs: &StepOutputs,
) -> PersistSummary {
    let mut summary = PersistSummary::default();

    for entry in outputs.env() {
        if !metadata.permits_env_output(&entry.category, &entry.name) {
            tracing::warn!(
                category = %entry.category,
                name = %entry.name,
                "Skipping undeclared pipeline environment output"
            );
            summary.skipped += 1;
            continue;
        }
        match env.write(&entry.category, &entry.name, &entry.value) {
            Ok(()) => summary.written += 1,
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist pipeline environment value");
                summary.failed += 1;
            }
        }
    }

    for m in outputs.measurements() {
        if !metadata.permits_measurement(&m.measurement) {
            tracing::warn!(measurement = %m.measurement, "Skipping undeclared measurement");
            summary.skipped += 1;
            continue;
        }
        let category = format!("influx/{}/{}", m.measurement, m.kind.as_str());
        match env.write(&category, &m.name, &m.value) {
            Ok(()) => summary.written += 1,
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist measurement");
                summary.failed += 1;
            }
        }
    }

    if summary.failed > 0 {
        fatal!(
            category = "infrastructure",
            failed = summary.failed,
            "failed to persist {} pipeline environment value(s)",
            summary.failed
        );
    } else {
        tracing::debug!(written = summary.written, "Pipeline environment persisted");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestep_log::{CollectorHook, LogLevel, LogSink, SharedBuffer};
    use std::sync::Arc;
    use tempfile::TempDir;

    const META: &str = r#"
name: demo
outputs:
  environment:
    - category: custom
      name: "*"
    - category: git
      name: commitId
  influx:
    - step_data
"#;

    fn capture() -> (LogSink, CollectorHook) {
        let sink = LogSink::with_writer(SharedBuffer::new());
        let hook = CollectorHook::default();
        sink.register_hook(Arc::new(hook.clone()));
        (sink, hook)
    }

    #[test]
    fn test_persists_declared_outputs() {
        let dir = TempDir::new().unwrap();
        let env = PipelineEnvironment::new(dir.path());
        let metadata = StepMetadata::from_yaml(META).unwrap();

        let mut outputs = StepOutputs::new();
        outputs.set_env("custom", "anything", "x");
        outputs.set_env("git", "commitId", "abc");
        outputs.set_env("git", "branch", "main");
        outputs.add_field("step_data", "demo", true);
        outputs.add_tag("other", "t", "v");

        let (sink, hook) = capture();
        let _guard = sink.set_default();
        let summary = persist_environment(&env, &metadata, &outputs);

        assert_eq!(summary, PersistSummary { written: 3, skipped: 2, failed: 0 });
        assert!(dir.path().join("custom/anything").exists());
        assert!(!dir.path().join("git/branch").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("influx/step_data/fields/demo")).unwrap(),
            "true"
        );
        assert!(hook.collector().entries().iter().all(|e| e.level < LogLevel::Error));
    }

    #[test]
    fn test_failures_emit_one_fatal_after_all_writes() {
        let dir = TempDir::new().unwrap();
        // A regular file where a category directory should go.
        std::fs::write(dir.path().join("custom"), "blocker").unwrap();
        let env = PipelineEnvironment::new(dir.path());
        let metadata = StepMetadata::from_yaml(META).unwrap();

        let mut outputs = StepOutputs::new();
        outputs.set_env("custom", "a", "1");
        outputs.set_env("custom", "b", "2");
        outputs.set_env("git", "commitId", "abc");

        let (sink, hook) = capture();
        let _guard = sink.set_default();
        let summary = persist_environment(&env, &metadata, &outputs);

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.written, 1);
        assert!(!summary.is_success());

        let entries = hook.collector().entries();
        let fatal: Vec<_> = entries.iter().filter(|e| e.level == LogLevel::Fatal).collect();
        assert_eq!(fatal.len(), 1);
        assert_eq!(entries.last().map(|e| e.level), Some(LogLevel::Fatal));
        assert!(dir.path().join("git/commitId").exists());
    }
}
