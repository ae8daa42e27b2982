//! Shared HTTP client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::{ExecError, Result, RetryPolicy};

/// Default transport timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry and status settings shared across clones.
#[derive(Debug)]
struct Settings {
    max_retries: u32,
    /// `None` retries every 5xx and 429.
    retry_statuses: Option<Vec<u16>>,
    initial_backoff: Duration,
}

/// Thread-safe HTTP client shared by step bodies.
///
/// Error statuses are returned to the caller with the body unread; only
/// statuses in the retry set are retried.
///
/// # Example
///
/// ```no_run
/// use pipestep_exec::HttpClient;
///
/// # async fn example() -> pipestep_exec::Result<()> {
/// let client = HttpClient::builder()
///     .bearer_token("secret")
///     .max_retries(2)
///     .build()?;
///
/// let response = client.send(client.get("https://api.github.com/rate_limit")).await?;
/// let response = pipestep_exec::ensure_success(response).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    settings: Arc<Settings>,
    cancel: Option<CancellationToken>,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// A clone whose requests stop when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.http.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.http.post(url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.http.put(url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.http.delete(url)
    }

    /// Send a request, retrying transport failures and retryable statuses.
    ///
    /// Requests with streaming bodies cannot be cloned and get one attempt.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let policy = RetryPolicy::new(
            self.settings.max_retries + 1,
            self.settings.initial_backoff,
            MAX_BACKOFF,
        );
        let mut current = request;
        let mut attempt = 1;

        loop {
            let next = current.try_clone();
            let outcome = self.execute(current).await;

            let retry = match &outcome {
                Ok(response) => self.should_retry(response.status()),
                Err(ExecError::Transport { retryable, .. }) => *retryable,
                Err(_) => false,
            };
            let Some(next) = next.filter(|_| retry && attempt < policy.max_attempts) else {
                return outcome;
            };

            let backoff = policy.backoff(attempt);
            tracing::warn!(
                attempt = attempt,
                max_retries = self.settings.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                status = ?outcome.as_ref().ok().map(|r| r.status().as_u16()),
                "HTTP request failed, retrying"
            );
            self.sleep(backoff).await?;
            current = next;
            attempt += 1;
        }
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        match &self.settings.retry_statuses {
            Some(codes) => codes.contains(&status.as_u16()),
            None => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        match &self.cancel {
            Some(token) => tokio::select! {
                response = request.send() => Ok(response?),
                _ = token.cancelled() => Err(ExecError::Cancelled {
                    what: "HTTP request".to_string(),
                }),
            },
            None => Ok(request.send().await?),
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = token.cancelled() => Err(ExecError::Cancelled {
                    what: "HTTP request".to_string(),
                }),
            },
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("settings", &self.settings)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Turn an error status into [`ExecError::Status`], consuming the body.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ExecError::Status {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("error").to_string()
        } else {
            message
        },
    })
}

/// Builder for [`HttpClient`].
#[derive(Debug)]
pub struct HttpClientBuilder {
    max_retries: u32,
    retry_statuses: Option<Vec<u16>>,
    initial_backoff: Duration,
    timeout: Duration,
    trusted_certs: Vec<PathBuf>,
    cookie_jar: bool,
    bearer_token: Option<String>,
    headers: Vec<(String, String)>,
    user_agent: String,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_statuses: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            timeout: DEFAULT_TIMEOUT,
            trusted_certs: Vec::new(),
            cookie_jar: false,
            bearer_token: None,
            headers: Vec::new(),
            user_agent: format!("pipestep/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Retries after the first attempt.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Replace the default retry set (all 5xx and 429).
    pub fn retry_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry_statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// PEM files added to the trust roots.
    pub fn trusted_certs(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.trusted_certs.extend(paths);
        self
    }

    pub fn cookie_jar(mut self, enabled: bool) -> Self {
        self.cookie_jar = enabled;
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// A header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ExecError::InvalidConfig(format!("invalid bearer token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExecError::InvalidConfig(format!("invalid header '{}': {}", name, e)))?;
            let mut value = HeaderValue::from_str(value)
                .map_err(|e| ExecError::InvalidConfig(format!("invalid value for '{}': {}", name, e)))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .cookie_store(self.cookie_jar);

        for path in &self.trusted_certs {
            let pem = std::fs::read(path).map_err(|e| {
                ExecError::InvalidConfig(format!("cannot read certificate {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ExecError::InvalidConfig(format!("invalid certificate {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| ExecError::InvalidConfig(e.to_string()))?;

        Ok(HttpClient {
            http,
            settings: Arc::new(Settings {
                max_retries: self.max_retries,
                retry_statuses: self.retry_statuses,
                initial_backoff: self.initial_backoff,
            }),
            cancel: None,
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
