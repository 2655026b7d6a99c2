//! Retrying HTTP request execution for REST-backed providers.
//!
//! One logical call becomes up to `max_retries` physical attempts. Only the
//! statuses providers use for throttling and gateway hiccups are retried;
//! everything else is handed back to the caller on the first response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::wait::sleep_or_cancel;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const MAX_ERROR_BODY: usize = 512;

/// Returns `true` for statuses that are worth another attempt.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Header carrying the provider credential on every request.
#[derive(Clone, Eq, PartialEq)]
pub struct AuthHeader {
    name: &'static str,
    value: String,
}

impl AuthHeader {
    /// Scaleway style `X-Auth-Token: <secret>`.
    #[must_use]
    pub fn token(secret: &str) -> Self {
        Self {
            name: "X-Auth-Token",
            value: secret.to_owned(),
        }
    }

    /// `Authorization: Bearer <token>`.
    #[must_use]
    pub fn bearer(token: &str) -> Self {
        Self {
            name: "Authorization",
            value: format!("Bearer {token}"),
        }
    }

    /// Header name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Header value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// A fully resolved request as handed to a transport.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Credential header.
    pub auth: AuthHeader,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
}

/// A buffered response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Body as lossy UTF-8, truncated for error messages.
    #[must_use]
    pub fn text_snippet(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(MAX_ERROR_BODY).collect()
    }

    /// Classifies non-2xx responses into [`ProviderError`] variants.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Authentication`] for 401/403,
    /// [`ProviderError::NotFound`] naming `resource` for 404, and
    /// [`ProviderError::Api`] for every other non-success status.
    pub fn error_for_status(self, resource: &str) -> Result<Self, ProviderError> {
        match self.status {
            _ if self.is_success() => Ok(self),
            401 | 403 => Err(ProviderError::Authentication {
                status: self.status,
                message: self.text_snippet(),
            }),
            404 => Err(ProviderError::not_found(resource)),
            status => Err(ProviderError::Api {
                status,
                message: self.text_snippet(),
            }),
        }
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Decode`] when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self, context: &str) -> Result<T, ProviderError> {
        serde_json::from_slice(&self.body).map_err(|err| ProviderError::decode(context, err))
    }
}

/// Failure to obtain any response at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("transport error: {message}")]
pub struct TransportError {
    /// Message reported by the transport.
    pub message: String,
}

impl TransportError {
    /// Creates a transport error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Future returned by [`HttpTransport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Sends a single physical request. Implementations never retry.
pub trait HttpTransport: Send + Sync {
    /// Performs one attempt.
    fn send<'a>(&'a self, request: &'a HttpRequest) -> TransportFuture<'a>;
}

/// Production transport backed by a shared `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with bounded connect and request timeouts.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a HttpRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .header(request.auth.name(), request.auth.value());
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            let response = builder
                .send()
                .await
                .map_err(|err| TransportError::new(err.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::new(err.to_string()))?;
            Ok(HttpResponse::new(status, body.to_vec()))
        })
    }
}

/// Retry budget for a [`RequestExecutor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Zero is treated as
    /// one.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }
}

enum Failure {
    Status { status: u16, message: String },
    Transport(String),
}

impl Failure {
    fn into_error(self, attempts: u32) -> ProviderError {
        match self {
            Self::Status {
                status: 429,
                message,
            } => ProviderError::RateLimited { attempts, message },
            Self::Status { status, message } => ProviderError::Transient {
                attempts,
                message: format!("status {status}: {message}"),
            },
            Self::Transport(message) => ProviderError::Transient { attempts, message },
        }
    }
}

/// Issues authenticated requests against one API base URL, retrying
/// throttled and transiently failing attempts.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    auth: AuthHeader,
    policy: RetryPolicy,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Creates an executor; trailing slashes on `base_url` are ignored.
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: &str,
        auth: AuthHeader,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim().trim_end_matches('/').to_owned(),
            auth,
            policy,
        }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Executes one logical call.
    ///
    /// Callers must not assume any particular number of physical attempts.
    /// Responses with a terminal status (including 4xx) are returned as-is;
    /// use [`HttpResponse::error_for_status`] to classify them.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::RateLimited`] or [`ProviderError::Transient`]
    /// once every attempt failed, and [`ProviderError::Cancelled`] as soon as
    /// `cancel` fires.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse, ProviderError> {
        let request = HttpRequest {
            method,
            url: self.url(path),
            auth: self.auth.clone(),
            body,
        };
        let max_attempts = self.policy.max_retries.max(1);
        let mut last_failure = Failure::Transport(String::from("no attempt made"));

        for attempt in 1..=max_attempts {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                outcome = self.transport.send(&request) => outcome,
            };

            last_failure = match outcome {
                Ok(response) if is_retryable_status(response.status) => {
                    debug!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        status = response.status,
                        "retryable status"
                    );
                    Failure::Status {
                        status: response.status,
                        message: response.text_snippet(),
                    }
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        error = %err,
                        "transport failure"
                    );
                    Failure::Transport(err.message)
                }
            };

            if attempt < max_attempts {
                sleep_or_cancel(cancel, self.policy.retry_delay).await?;
            }
        }

        let error = last_failure.into_error(max_attempts);
        warn!(
            method = %request.method,
            url = %request.url,
            attempts = max_attempts,
            error = %error,
            "request failed after exhausting retries"
        );
        Err(error)
    }

    /// Executes a call and decodes a successful JSON body.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::execute`] failures, classifies non-2xx responses via
    /// [`HttpResponse::error_for_status`], and returns
    /// [`ProviderError::Decode`] for malformed bodies.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        resource: &str,
    ) -> Result<T, ProviderError> {
        self.execute(cancel, method, path, body)
            .await?
            .error_for_status(resource)?
            .json(resource)
    }
}
