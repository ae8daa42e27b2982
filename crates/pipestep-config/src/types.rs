//! Project configuration file types.
//!
//! ```yaml
//! general:
//!   verbose: false
//!   vaultBasePath: piper
//! stages:
//!   Build:
//!     level: info
//! steps:
//!   demo:
//!     name: team
//! hooks:
//!   telemetry:
//!     endpoint: https://telemetry.example.com/events
//!   splunk:
//!     dsn: https://splunk.example.com/services/collector
//!     sendLogs: true
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{ConfigError, EnvSnapshot, Result};

/// A section of parameter-name → value entries.
pub type Section = Map<String, Value>;

/// Parsed project configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    #[serde(deserialize_with = "null_default")]
    pub general: Section,
    /// Keyed by stage name.
    #[serde(deserialize_with = "null_default")]
    pub stages: BTreeMap<String, Section>,
    /// Keyed by step name.
    #[serde(deserialize_with = "null_default")]
    pub steps: BTreeMap<String, Section>,
    #[serde(deserialize_with = "null_default")]
    pub hooks: HookConfig,
}

impl ProjectConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_at(yaml, "<inline>")
    }

    pub(crate) fn from_yaml_at(yaml: &str, path: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseYaml {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub fn stage(&self, name: &str) -> Option<&Section> {
        self.stages.get(name)
    }

    pub fn step(&self, name: &str) -> Option<&Section> {
        self.steps.get(name)
    }
}

/// Treat an explicit YAML `null` (an empty section) as the default.
fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ─────────────────────────────────────────────────────────────────────────────
// Hooks
// ─────────────────────────────────────────────────────────────────────────────

/// Settings of the optional external integrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    #[serde(deserialize_with = "null_default")]
    pub telemetry: TelemetryHook,
    #[serde(deserialize_with = "null_default")]
    pub sentry: SentryHook,
    #[serde(deserialize_with = "null_default")]
    pub splunk: SplunkHook,
    #[serde(deserialize_with = "null_default")]
    pub pubsub: PubSubHook,
    #[serde(deserialize_with = "null_default")]
    pub vault: VaultHook,
    #[serde(deserialize_with = "null_default")]
    pub bucket: BucketHook,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryHook {
    /// Where the telemetry record is POSTed.
    pub endpoint: Option<String>,
}

/// Remote log sink receiving warnings and errors as they happen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentryHook {
    pub dsn: Option<String>,
}

/// HEC-style log forwarding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SplunkHook {
    pub dsn: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub index: Option<String>,
    /// Forward collected log entries of failed runs.
    pub send_logs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PubSubHook {
    pub enabled: bool,
    pub project_id: Option<String>,
    pub topic: Option<String>,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl PubSubHook {
    pub const DEFAULT_ENDPOINT: &'static str = "https://pubsub.googleapis.com";
}

/// Remote secret store connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultHook {
    pub server_url: Option<String>,
    pub namespace: Option<String>,
    /// Upper bound in seconds for the wait between read retries.
    pub retry_max_wait: Option<u64>,
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(skip)]
    pub app_role_id: Option<String>,
    #[serde(skip)]
    pub app_role_secret_id: Option<String>,
}

/// Report bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketHook {
    pub name: Option<String>,
    pub folder: Option<String>,
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
}

impl HookConfig {
    /// Overlay settings supplied through `<prefix>_*` environment variables.
    pub fn apply_env(&mut self, env: &EnvSnapshot, prefix: &str) {
        let var = |name: &str| env.prefixed(prefix, name).map(str::to_string);

        if let Some(v) = var("TELEMETRY_URL") {
            self.telemetry.endpoint = Some(v);
        }
        if let Some(v) = var("SENTRY_DSN") {
            self.sentry.dsn = Some(v);
        }
        if let Some(v) = var("SPLUNK_DSN") {
            self.splunk.dsn = Some(v);
        }
        if let Some(v) = var("SPLUNK_TOKEN") {
            self.splunk.token = Some(v);
        }
        if let Some(v) = var("PUBSUB_PROJECT") {
            self.pubsub.project_id = Some(v);
            self.pubsub.enabled = true;
        }
        if let Some(v) = var("PUBSUB_TOPIC") {
            self.pubsub.topic = Some(v);
        }
        if let Some(v) = var("PUBSUB_TOKEN") {
            self.pubsub.token = Some(v);
        }
        if let Some(v) = var("VAULT_ADDR") {
            self.vault.server_url = Some(v);
        }
        if let Some(v) = var("VAULT_NAMESPACE") {
            self.vault.namespace = Some(v);
        }
        if let Some(v) = var("vaultToken") {
            self.vault.token = Some(v);
        }
        if let Some(v) = var("vaultAppRoleID") {
            self.vault.app_role_id = Some(v);
        }
        if let Some(v) = var("vaultAppRoleSecretID") {
            self.vault.app_role_secret_id = Some(v);
        }
        if let Some(v) = var("REPORT_BUCKET") {
            self.bucket.name = Some(v);
        }
        if let Some(v) = var("BUCKET_TOKEN") {
            self.bucket.token = Some(v);
        }
    }

    /// Reject settings that cannot work, before anything is registered.
    pub fn validate(&self) -> Result<()> {
        check_url("telemetry", self.telemetry.endpoint.as_deref())?;
        check_url("sentry", self.sentry.dsn.as_deref())?;
        check_url("splunk", self.splunk.dsn.as_deref())?;
        check_url("pubsub", self.pubsub.endpoint.as_deref())?;
        check_url("vault", self.vault.server_url.as_deref())?;
        check_url("bucket", self.bucket.endpoint.as_deref())?;

        if self.pubsub.enabled && (self.pubsub.project_id.is_none() || self.pubsub.topic.is_none()) {
            return Err(ConfigError::InvalidHook {
                hook: "pubsub".to_string(),
                message: "projectId and topic are required when enabled".to_string(),
            });
        }
        if self.vault.app_role_id.is_some() != self.vault.app_role_secret_id.is_some() {
            return Err(ConfigError::InvalidHook {
                hook: "vault".to_string(),
                message: "AppRole login needs both role id and secret id".to_string(),
            });
        }
        Ok(())
    }

    /// Credentials carried by the hooks, for masking.
    pub fn secrets(&self) -> Vec<&str> {
        [
            self.splunk.token.as_deref(),
            self.pubsub.token.as_deref(),
            self.vault.token.as_deref(),
            self.vault.app_role_secret_id.as_deref(),
            self.bucket.token.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

fn check_url(hook: &str, value: Option<&str>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let url = url::Url::parse(value).map_err(|e| ConfigError::InvalidHook {
        hook: hook.to_string(),
        message: format!("'{}' is not a valid URL: {}", value, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidHook {
            hook: hook.to_string(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}
