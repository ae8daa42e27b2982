//! Log forwarding to a Splunk HTTP Event Collector.
//!
//! Every post carries the telemetry record. Collected log entries ride along
//! only for failed runs and only when `sendLogs` is enabled, split into
//! batches of [`BATCH_SIZE`].

use async_trait::async_trait;
use pipestep_exec::{HttpClient, ensure_success};
use pipestep_log::LogEntry;
use serde::Serialize;
use url::Url;

use crate::sink::parse_endpoint;
use crate::{Result, TelemetryError, TelemetryRecord};

/// Maximum log entries per post.
pub const BATCH_SIZE: usize = 5000;

const SOURCE_TYPE: &str = "_json";

/// Ships the record together with collected log entries.
#[async_trait]
pub trait LogForwarder: Send + Sync {
    /// Returns the number of posts made.
    async fn forward(&self, record: &TelemetryRecord, entries: &[LogEntry]) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct SplunkSettings {
    pub dsn: String,
    pub token: String,
    pub index: String,
    pub send_logs: bool,
    pub host: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    time: f64,
    host: &'a str,
    source: &'a str,
    sourcetype: &'a str,
    index: &'a str,
    event: Event<'a>,
}

#[derive(Serialize)]
struct Event<'a> {
    messages: &'a [LogEntry],
    telemetry: &'a TelemetryRecord,
}

#[derive(Debug, Clone)]
pub struct SplunkForwarder {
    http: HttpClient,
    dsn: Url,
    authorization: String,
    index: String,
    host: String,
    send_logs: bool,
    batch_size: usize,
}

impl SplunkForwarder {
    /// The token is sent as `Authorization: Splunk <token>`.
    pub fn new(http: HttpClient, settings: SplunkSettings) -> Result<Self> {
        let dsn = parse_endpoint("log forwarding", &settings.dsn)?;
        let authorization = if settings.token.starts_with("Splunk ") {
            settings.token
        } else {
            format!("Splunk {}", settings.token)
        };
        Ok(Self {
            http,
            dsn,
            authorization,
            index: settings.index,
            host: settings.host,
            send_logs: settings.send_logs,
            batch_size: BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn post(&self, record: &TelemetryRecord, messages: &[LogEntry]) -> Result<()> {
        let envelope = Envelope {
            time: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            host: &self.host,
            source: &record.correlation_id,
            sourcetype: SOURCE_TYPE,
            index: &self.index,
            event: Event {
                messages,
                telemetry: record,
            },
        };
        let request = self
            .http
            .post(self.dsn.as_str())
            .header("Authorization", &self.authorization)
            .json(&envelope);
        let response = self
            .http
            .send(request)
            .await
            .map_err(TelemetryError::http("log forwarding"))?;
        ensure_success(response)
            .await
            .map_err(TelemetryError::http("log forwarding"))?;
        Ok(())
    }
}

#[async_trait]
impl LogForwarder for SplunkForwarder {
    async fn forward(&self, record: &TelemetryRecord, entries: &[LogEntry]) -> Result<usize> {
        if !record.failed() || !self.send_logs || entries.is_empty() {
            self.post(record, &[]).await?;
            return Ok(1);
        }

        let mut posts = 0;
        for batch in entries.chunks(self.batch_size) {
            self.post(record, batch).await?;
            posts += 1;
        }
        tracing::debug!(entries = entries.len(), posts = posts, "Forwarded log entries");
        Ok(posts)
    }
}
