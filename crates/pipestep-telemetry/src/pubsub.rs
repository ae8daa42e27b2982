//! Run events published to a pub/sub topic as CloudEvents.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pipestep_exec::{HttpClient, ensure_success};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::sink::parse_endpoint;
use crate::{Result, TelemetryError, TelemetryRecord};

/// Event type of the record published at the end of a run.
pub const STEP_FINISHED: &str = "dev.pipestep.step.finished";

/// A CloudEvents 1.0 envelope in structured JSON mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: String,
    pub datacontenttype: String,
    pub data: Value,
}

impl CloudEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            specversion: "1.0".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            datacontenttype: "application/json".to_string(),
            data,
        }
    }

    /// The end-of-run event for `record`.
    pub fn step_finished(record: &TelemetryRecord) -> Result<Self> {
        Ok(Self::new(
            STEP_FINISHED,
            format!("/steps/{}", record.step_name),
            serde_json::to_value(record)?,
        ))
    }
}

/// Publishes events to an external topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns the message id assigned by the broker, when it reports one.
    async fn publish(&self, event: &CloudEvent) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct PubSubSettings {
    pub endpoint: String,
    pub project_id: String,
    pub topic: String,
    pub token: Option<String>,
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<PubSubMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PubSubMessage {
    data: String,
    ordering_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Google Pub/Sub REST publisher.
#[derive(Debug, Clone)]
pub struct PubSubPublisher {
    http: HttpClient,
    url: Url,
    token: Option<String>,
}

impl PubSubPublisher {
    pub fn new(http: HttpClient, settings: PubSubSettings) -> Result<Self> {
        if settings.project_id.is_empty() || settings.topic.is_empty() {
            return Err(TelemetryError::InvalidConfig {
                sink: "pub/sub",
                message: "project and topic are required".to_string(),
            });
        }
        let endpoint = parse_endpoint("pub/sub", &settings.endpoint)?;
        let url = format!(
            "{}/v1/projects/{}/topics/{}:publish",
            endpoint.as_str().trim_end_matches('/'),
            settings.project_id,
            settings.topic
        );
        let url = parse_endpoint("pub/sub", &url)?;
        Ok(Self {
            http,
            url,
            token: settings.token.filter(|t| !t.is_empty()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(&self, event: &CloudEvent) -> Result<Option<String>> {
        let payload = serde_json::to_vec(event)?;
        let body = PublishRequest {
            messages: vec![PubSubMessage {
                data: STANDARD.encode(payload),
                ordering_key: event.source.clone(),
            }],
        };

        let mut request = self.http.post(self.url.as_str()).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = self
            .http
            .send(request)
            .await
            .map_err(TelemetryError::http("pub/sub"))?;
        let response = ensure_success(response)
            .await
            .map_err(TelemetryError::http("pub/sub"))?;

        let text = response
            .text()
            .await
            .map_err(|e| TelemetryError::http("pub/sub")(e.into()))?;
        let id = serde_json::from_str::<PublishResponse>(&text)
            .ok()
            .and_then(|r| r.message_ids.into_iter().next());
        tracing::debug!(event_id = %event.id, message_id = ?id, "Event published");
        Ok(id)
    }
}
