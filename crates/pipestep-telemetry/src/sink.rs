//! Telemetry backends.

use async_trait::async_trait;
use pipestep_exec::{HttpClient, ensure_success};
use url::Url;

use crate::{Result, TelemetryError, TelemetryRecord};

/// Ships the finished record.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Parse an endpoint, accepting only http and https.
pub(crate) fn parse_endpoint(sink: &'static str, endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint).map_err(|e| TelemetryError::InvalidConfig {
        sink,
        message: format!("invalid endpoint '{}': {}", endpoint, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TelemetryError::InvalidConfig {
            sink,
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

/// POSTs the record as JSON.
#[derive(Debug, Clone)]
pub struct HttpTelemetrySink {
    http: HttpClient,
    endpoint: Url,
}

impl HttpTelemetrySink {
    pub fn new(http: HttpClient, endpoint: &str) -> Result<Self> {
        Ok(Self {
            http,
            endpoint: parse_endpoint("telemetry", endpoint)?,
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn send(&self, record: &TelemetryRecord) -> Result<()> {
        let request = self.http.post(self.endpoint.as_str()).json(record);
        let response = self
            .http
            .send(request)
            .await
            .map_err(TelemetryError::http("telemetry"))?;
        ensure_success(response)
            .await
            .map_err(TelemetryError::http("telemetry"))?;
        tracing::debug!(endpoint = %self.endpoint, "Telemetry sent");
        Ok(())
    }
}

/// Used when no backend is configured or telemetry is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetrySink;

#[async_trait]
impl TelemetrySink for NoopTelemetrySink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn send(&self, _record: &TelemetryRecord) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_endpoints() {
        let http = HttpClient::builder().build().unwrap();
        assert!(matches!(
            HttpTelemetrySink::new(http.clone(), "not a url"),
            Err(TelemetryError::InvalidConfig { .. })
        ));
        assert!(HttpTelemetrySink::new(http.clone(), "ftp://host/x").is_err());
        assert!(HttpTelemetrySink::new(http, "https://telemetry.local/v1").is_ok());
    }

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let sink = NoopTelemetrySink;
        assert!(sink.send(&TelemetryRecord::new("demo")).await.is_ok());
        assert_eq!(sink.name(), "noop");
    }
}
