//! Remote bucket uploads.

use std::path::Path;

use async_trait::async_trait;
use pipestep_exec::{HttpClient, ensure_success};

use crate::{ReportError, Result};

/// Destination for published report files.
#[async_trait]
pub trait BucketUploader: Send + Sync {
    /// Bucket name, for logging.
    fn bucket(&self) -> &str;

    /// Upload the local file at `path` as `object`.
    async fn upload(&self, object: &str, path: &Path) -> Result<()>;
}

/// Uploader speaking the JSON API of Google Cloud Storage (media uploads).
#[derive(Debug, Clone)]
pub struct GcsUploader {
    client: HttpClient,
    endpoint: String,
    bucket: String,
}

impl GcsUploader {
    pub const DEFAULT_ENDPOINT: &'static str = "https://storage.googleapis.com";

    pub fn new(client: HttpClient, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        }
    }

    fn upload_url(&self, object: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(object)
        )
    }
}

#[async_trait]
impl BucketUploader for GcsUploader {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, object: &str, path: &Path) -> Result<()> {
        let upload_err = |message: String| ReportError::Upload {
            object: object.to_string(),
            message,
        };
        let body = tokio::fs::read(path).await.map_err(|source| ReportError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let request = self
            .client
            .post(&self.upload_url(object))
            .header("Content-Type", "application/octet-stream")
            .body(body);
        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        ensure_success(response)
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        tracing::debug!(bucket = %self.bucket, object = object, "Uploaded report");
        Ok(())
    }
}
