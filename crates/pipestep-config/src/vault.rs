//! Remote key/value secret store.
//!
//! Speaks the HTTP API of HashiCorp Vault: `/v1/<path>` with an
//! `X-Vault-Token` header, KV v1 and v2 mounts, AppRole login and token
//! self-revocation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pipestep_exec::{ExecError, HttpClient, RetryPolicy, ensure_success, with_retry};
use pipestep_log::SecretMask;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::{ConfigError, Result, VaultHook};

/// Read access to a remote secret store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Key/value pairs stored at `path`; `None` when nothing is stored there.
    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// Give up the authentication token.
    async fn revoke(&self) -> Result<()>;
}

/// How to authenticate against the store.
#[derive(Clone, PartialEq, Eq)]
pub enum VaultAuth {
    Token(String),
    AppRole { role_id: String, secret_id: String },
}

impl std::fmt::Debug for VaultAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultAuth::Token(_) => write!(f, "Token(***)"),
            VaultAuth::AppRole { role_id, .. } => write!(f, "AppRole({})", role_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub server_url: String,
    pub namespace: Option<String>,
    pub auth: VaultAuth,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl VaultSettings {
    pub fn new(server_url: impl Into<String>, auth: VaultAuth) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            namespace: None,
            auth,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Settings from the hook section; `None` without a server or credentials.
    pub fn from_hook(hook: &VaultHook) -> Option<Self> {
        let server = hook.server_url.as_deref()?;
        let auth = match (&hook.token, &hook.app_role_id, &hook.app_role_secret_id) {
            (Some(token), _, _) => VaultAuth::Token(token.clone()),
            (None, Some(role_id), Some(secret_id)) => VaultAuth::AppRole {
                role_id: role_id.clone(),
                secret_id: secret_id.clone(),
            },
            _ => return None,
        };
        let mut settings = Self::new(server, auth);
        settings.namespace = hook.namespace.clone();
        if let Some(secs) = hook.retry_max_wait {
            let default = RetryPolicy::default();
            settings.retry =
                RetryPolicy::new(default.max_attempts, default.initial_backoff, Duration::from_secs(secs));
        }
        Some(settings)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Vault-compatible client holding a live token.
pub struct VaultClient {
    http: HttpClient,
    server_url: String,
    namespace: Option<String>,
    token: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("server_url", &self.server_url)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Deserialize)]
struct MountResponse {
    data: MountData,
}

#[derive(Deserialize)]
struct MountData {
    path: String,
    #[serde(default)]
    options: Option<BTreeMap<String, String>>,
}

impl VaultClient {
    /// Authenticate and return a ready client. The token is registered with
    /// `mask` before any request is made.
    pub async fn connect(settings: VaultSettings, mask: &SecretMask) -> Result<Self> {
        let http = HttpClient::builder()
            .max_retries(0)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| remote_err("", e))?;

        let mut client = Self {
            http,
            server_url: settings.server_url,
            namespace: settings.namespace,
            token: String::new(),
            retry: settings.retry,
        };

        client.token = match settings.auth {
            VaultAuth::Token(token) => token,
            VaultAuth::AppRole { role_id, secret_id } => {
                mask.register(&secret_id);
                let body = serde_json::json!({ "role_id": role_id, "secret_id": secret_id });
                let text = client
                    .call(Method::POST, "auth/approle/login", Some(&body))
                    .await?
                    .ok_or_else(|| ConfigError::RemoteStore {
                        path: "auth/approle/login".to_string(),
                        message: "AppRole mount not found".to_string(),
                    })?;
                let login: LoginResponse = serde_json::from_str(&text).map_err(|e| ConfigError::RemoteStore {
                    path: "auth/approle/login".to_string(),
                    message: e.to_string(),
                })?;
                tracing::debug!("Logged in to remote secret store with AppRole");
                login.auth.client_token
            }
        };
        mask.register(&client.token);
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.server_url, path.trim_start_matches('/'))
    }

    /// One request with retries; `None` on 404.
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<String>> {
        let url = self.url(path);
        with_retry(&self.retry, "remote secret store request", || {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-Vault-Request", "true");
            if !self.token.is_empty() {
                request = request.header("X-Vault-Token", &self.token);
            }
            if let Some(ns) = &self.namespace {
                request = request.header("X-Vault-Namespace", ns);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            fetch(self.http.clone(), request)
        })
        .await
        .map_err(|e| remote_err(path, e))
    }

    /// Mount path and KV version for `path`.
    async fn mount_of(&self, path: &str) -> Result<Option<(String, u32)>> {
        let Some(text) = self
            .call(Method::GET, &format!("sys/internal/ui/mounts/{}", path), None)
            .await?
        else {
            return Ok(None);
        };
        let Ok(mount) = serde_json::from_str::<MountResponse>(&text) else {
            return Ok(None);
        };
        let version = mount
            .data
            .options
            .as_ref()
            .and_then(|o| o.get("version"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Ok(Some((mount.data.path, version)))
    }
}

async fn fetch(http: HttpClient, request: RequestBuilder) -> std::result::Result<Option<String>, ExecError> {
    let response = http.send(request).await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = ensure_success(response).await?;
    Ok(Some(response.text().await?))
}

/// Insert `data/` after the mount for KV v2 paths.
fn kv2_path(mount: &str, path: &str) -> String {
    let mount = mount.trim_end_matches('/');
    let rest = path
        .strip_prefix(mount)
        .unwrap_or(path)
        .trim_start_matches('/');
    format!("{}/data/{}", mount, rest)
}

fn to_strings(map: serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect()
}

fn remote_err(path: &str, err: ExecError) -> ConfigError {
    ConfigError::RemoteStore {
        path: path.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl RemoteStore for VaultClient {
    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, String>>> {
        let path = path.trim_matches('/');
        let (read_path, kv2) = match self.mount_of(path).await? {
            Some((mount, 2)) => (kv2_path(&mount, path), true),
            _ => (path.to_string(), false),
        };

        let Some(text) = self.call(Method::GET, &read_path, None).await? else {
            return Ok(None);
        };
        let body: Value = serde_json::from_str(&text).map_err(|e| ConfigError::RemoteStore {
            path: read_path.clone(),
            message: e.to_string(),
        })?;
        let data = if kv2 {
            body.get("data").and_then(|d| d.get("data"))
        } else {
            body.get("data")
        };
        Ok(data.and_then(Value::as_object).cloned().map(to_strings))
    }

    async fn revoke(&self) -> Result<()> {
        self.call(Method::POST, "auth/token/revoke-self", None).await?;
        tracing::debug!("Remote secret store token revoked");
        Ok(())
    }
}
