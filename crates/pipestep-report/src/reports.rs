//! Report manifests and publication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipestep_types::ReportOutput;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::{BucketUploader, PipelineEnvironment, ReportError, Result};

/// Manifest file listing report records.
pub const REPORTS_FILE: &str = "reports.json";
/// Manifest file listing links.
pub const LINKS_FILE: &str = "links.json";

/// A report file produced by the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Path of the file, relative to the working directory.
    pub target: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    /// Output resource type, e.g. `sbom`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub report_type: Option<String>,
}

impl ReportRecord {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: String::new(),
            mandatory: false,
            report_type: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_type(mut self, report_type: impl Into<String>) -> Self {
        self.report_type = Some(report_type.into());
        self
    }
}

/// A named link shown alongside reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub target: String,
    #[serde(default)]
    pub name: String,
}

impl Link {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
        }
    }
}

/// Append records and links to the manifests under the environment root.
///
/// Existing entries are kept; identical entries are not duplicated. A
/// manifest with nothing to add is left untouched.
pub fn write_manifest(env: &PipelineEnvironment, reports: &[ReportRecord], links: &[Link]) -> Result<()> {
    append_unique(&env.root().join(REPORTS_FILE), reports)?;
    append_unique(&env.root().join(LINKS_FILE), links)
}

pub fn read_manifest(env: &PipelineEnvironment) -> Result<Vec<ReportRecord>> {
    read_array(&env.root().join(REPORTS_FILE))
}

pub fn read_links(env: &PipelineEnvironment) -> Result<Vec<Link>> {
    read_array(&env.root().join(LINKS_FILE))
}

fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(ReportError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn append_unique<T>(path: &Path, items: &[T]) -> Result<()>
where
    T: Serialize + DeserializeOwned + PartialEq + Clone,
{
    if items.is_empty() {
        return Ok(());
    }
    let mut all: Vec<T> = read_array(path)?;
    for item in items {
        if !all.contains(item) {
            all.push(item.clone());
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ReportError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let text = serde_json::to_string_pretty(&all)?;
    std::fs::write(path, text).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Result of a publication pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Records written to the manifest by this pass.
    pub records: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
    /// Targets of mandatory reports that are missing or failed to upload.
    pub mandatory_failures: Vec<String>,
}

impl PublishSummary {
    pub fn is_success(&self) -> bool {
        self.mandatory_failures.is_empty()
    }
}

/// A record scheduled for publication with its upload sub-folder.
struct Pending {
    record: ReportRecord,
    sub_folder: Option<String>,
}

/// Publishes report files: manifest, typed output registration, bucket upload.
pub struct ReportPublisher {
    env: PipelineEnvironment,
    workdir: PathBuf,
    uploader: Option<Arc<dyn BucketUploader>>,
    folder: String,
}

impl ReportPublisher {
    pub fn new(env: PipelineEnvironment, workdir: impl Into<PathBuf>) -> Self {
        Self {
            env,
            workdir: workdir.into(),
            uploader: None,
            folder: String::new(),
        }
    }

    /// Upload matching reports below `folder` in the uploader's bucket.
    pub fn with_uploader(mut self, uploader: Arc<dyn BucketUploader>, folder: impl Into<String>) -> Self {
        self.uploader = Some(uploader);
        self.folder = folder.into();
        self
    }

    /// Publish the body's records plus every file matching `patterns`.
    pub async fn publish(
        &self,
        patterns: &[ReportOutput],
        records: &[ReportRecord],
        links: &[Link],
    ) -> Result<PublishSummary> {
        let pending = self.collect(patterns, records)?;
        let mut summary = PublishSummary {
            records: pending.len(),
            ..Default::default()
        };

        for p in &pending {
            if p.record.mandatory && !self.resolve(&p.record.target).is_file() {
                tracing::error!(target_path = %p.record.target, "Mandatory report is missing");
                summary.mandatory_failures.push(p.record.target.clone());
            }
        }

        let manifest: Vec<ReportRecord> = pending.iter().map(|p| p.record.clone()).collect();
        write_manifest(&self.env, &manifest, links)?;

        if let Some(uploader) = &self.uploader {
            for p in pending.iter().filter(|p| p.sub_folder.is_some()) {
                let path = self.resolve(&p.record.target);
                if !path.is_file() {
                    continue;
                }
                let object = self.object_name(p.sub_folder.as_deref().unwrap_or_default(), &p.record.target);
                match uploader.upload(&object, &path).await {
                    Ok(()) => summary.uploaded += 1,
                    Err(e) => {
                        tracing::warn!(bucket = uploader.bucket(), error = %e, "Report upload failed");
                        summary.upload_failures += 1;
                        if p.record.mandatory && !summary.mandatory_failures.contains(&p.record.target) {
                            summary.mandatory_failures.push(p.record.target.clone());
                        }
                    }
                }
            }
            tracing::info!(
                bucket = uploader.bucket(),
                uploaded = summary.uploaded,
                failed = summary.upload_failures,
                "Reports uploaded"
            );
        }

        Ok(summary)
    }

    fn collect(&self, patterns: &[ReportOutput], records: &[ReportRecord]) -> Result<Vec<Pending>> {
        let compiled = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(&p.file_pattern)
                    .map(|g| (g, p))
                    .map_err(|e| ReportError::Pattern {
                        pattern: p.file_pattern.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let classify = |target: &str| {
            compiled
                .iter()
                .find(|(g, _)| g.matches(target))
                .map(|(_, output)| *output)
        };

        let mut pending: Vec<Pending> = records
            .iter()
            .map(|record| {
                let mut record = record.clone();
                let sub_folder = classify(&record.target).map(|output| {
                    record.report_type.get_or_insert_with(|| output.report_type.clone());
                    output.sub_folder.clone()
                });
                Pending { record, sub_folder }
            })
            .collect();

        for (pattern, output) in &compiled {
            let full = self.workdir.join(pattern.as_str());
            let entries = glob::glob(&full.to_string_lossy()).map_err(|e| ReportError::Pattern {
                pattern: output.file_pattern.clone(),
                message: e.to_string(),
            })?;
            for path in entries.flatten().filter(|p| p.is_file()) {
                let target = path
                    .strip_prefix(&self.workdir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                if pending.iter().any(|p| p.record.target == target) {
                    continue;
                }
                pending.push(Pending {
                    record: ReportRecord::new(target).with_type(output.report_type.clone()),
                    sub_folder: Some(output.sub_folder.clone()),
                });
            }
        }
        Ok(pending)
    }

    fn resolve(&self, target: &str) -> PathBuf {
        self.workdir.join(target)
    }

    fn object_name(&self, sub_folder: &str, target: &str) -> String {
        [self.folder.as_str(), sub_folder, target]
            .iter()
            .map(|part| part.trim_matches('/'))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_appends_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let env = PipelineEnvironment::new(dir.path());

        let a = ReportRecord::new("a.json").named("A").mandatory();
        let b = ReportRecord::new("b.json").with_type("sbom");
        write_manifest(&env, &[a.clone()], &[Link::new("Build", "https://ci/1")]).unwrap();
        write_manifest(&env, &[a.clone(), b.clone()], &[Link::new("Build", "https://ci/1")]).unwrap();

        assert_eq!(read_manifest(&env).unwrap(), vec![a, b]);
        assert_eq!(read_links(&env).unwrap().len(), 1);
    }

    #[test]
    fn test_manifest_entry_shape() {
        let dir = TempDir::new().unwrap();
        let env = PipelineEnvironment::new(dir.path());
        write_manifest(&env, &[ReportRecord::new("r.txt")], &[]).unwrap();
        assert!(!dir.path().join(LINKS_FILE).exists());
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(REPORTS_FILE)).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!([{"target": "r.txt", "name": "", "mandatory": false}])
        );
    }

    #[test]
    fn test_missing_manifest_reads_empty() {
        let dir = TempDir::new().unwrap();
        let env = PipelineEnvironment::new(dir.path());
        assert!(read_manifest(&env).unwrap().is_empty());
        assert!(read_links(&env).unwrap().is_empty());
    }

    #[test]
    fn test_object_name_skips_empty_parts() {
        let dir = TempDir::new().unwrap();
        let publisher = ReportPublisher::new(PipelineEnvironment::new(dir.path()), dir.path());
        assert_eq!(publisher.object_name("", "out/r.json"), "out/r.json");
        let publisher = ReportPublisher {
            folder: "/run-1/".to_string(),
            ..publisher
        };
        assert_eq!(publisher.object_name("sbom", "r.json"), "run-1/sbom/r.json");
    }

    #[tokio::test]
    async fn test_publish_without_bucket_registers_typed_reports() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(work.path().join("out")).unwrap();
        std::fs::write(work.path().join("out/bom.xml"), "<bom/>").unwrap();
        std::fs::write(work.path().join("out/notes.txt"), "n").unwrap();

        let env = PipelineEnvironment::new(root.path());
        let publisher = ReportPublisher::new(env.clone(), work.path());
        let patterns = vec![ReportOutput {
            file_pattern: "out/*.xml".to_string(),
            report_type: "sbom".to_string(),
            sub_folder: "sbom".to_string(),
        }];
        let summary = publisher
            .publish(&patterns, &[ReportRecord::new("missing.json").mandatory()], &[])
            .await
            .unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.mandatory_failures, vec!["missing.json".to_string()]);
        let manifest = read_manifest(&env).unwrap();
        let bom = manifest.iter().find(|r| r.target == "out/bom.xml").unwrap();
        assert_eq!(bom.report_type.as_deref(), Some("sbom"));
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let dir = TempDir::new().unwrap();
        let publisher = ReportPublisher::new(PipelineEnvironment::new(dir.path()), dir.path());
        let patterns = vec![ReportOutput {
            file_pattern: "[".to_string(),
            report_type: "x".to_string(),
            sub_folder: String::new(),
        }];
        let err = publisher.publish(&patterns, &[], &[]).await.unwrap_err();
        assert!(matches!(err, ReportError::Pattern { .. }));
    }
}
