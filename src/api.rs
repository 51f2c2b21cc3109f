//! POS backend API client.
//!
//! Authenticated HTTP communication with the backend: replaying queued
//! requests, the lightweight health check used for online detection, and
//! the register snapshot used for realtime reconciliation.

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::normalize_base_url;
use crate::error::{Error, Result};
use crate::queue::{HttpMethod, QueuedRequest};
use crate::storage::{CredentialStore, KEY_API_TOKEN};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Delivery seam between the sync engine and the network.
pub trait RequestSender: Send + Sync + 'static {
    /// Deliver one queued request. `Ok` means the server confirmed it.
    fn send(&self, request: &QueuedRequest) -> impl Future<Output = Result<Value>> + Send;

    /// Whether the backend currently answers.
    fn check_health(&self) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    if err.is_builder() {
        return Error::Config(format!("Invalid API URL: {url}"));
    }
    if err.is_connect() {
        return Error::Transport(format!("Cannot reach POS backend at {url}"));
    }
    if err.is_timeout() {
        return Error::Transport(format!("Connection to {url} timed out"));
    }
    Error::Transport(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API token is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Endpoint not found".to_string(),
        409 => "Request conflicts with server state".to_string(),
        429 => "Too many requests".to_string(),
        s if s >= 500 => "POS backend server error".to_string(),
        _ => "Unexpected response from POS backend".to_string(),
    }
}

/// Build the error for a non-success response, preferring the server's
/// own `error`/`message` field.
fn error_from_response(status: StatusCode, body_text: &str, retry_after_secs: Option<u64>) -> Error {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status));
    Error::Http {
        status: status.as_u16(),
        message,
        retry_after_secs,
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs pass through; paths are joined onto the base.
    pub fn resolve_url(&self, url: &str) -> String {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        if url.starts_with('/') {
            format!("{}{url}", self.base_url)
        } else {
            format!("{}/{url}", self.base_url)
        }
    }

    /// Bearer header, read fresh so a rotated token applies immediately.
    fn authorization(&self) -> Option<HeaderValue> {
        let token = self.credentials.get(KEY_API_TOKEN)?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str())).ok()?;
        value.set_sensitive(true);
        Some(value)
    }

    /// Build the HTTP request replaying `request`.
    pub fn build_request(&self, request: &QueuedRequest) -> Result<reqwest::Request> {
        let url = self.resolve_url(&request.url);
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.payload);
        if let Some(auth) = self.authorization() {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.build().map_err(|e| friendly_error(&url, &e))
    }

    async fn execute(&self, req: reqwest::Request) -> Result<Value> {
        let url = req.url().to_string();
        let resp = self
            .client
            .execute(req)
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body_text = resp.text().await.unwrap_or_default();
            debug!(%url, status = status.as_u16(), "API request rejected");
            return Err(error_from_response(status, &body_text, retry_after));
        }

        // A 2xx is a confirmed delivery whatever the body looks like: JSON,
        // null for empty 204 responses, or the raw text otherwise.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body_text).unwrap_or(Value::String(body_text)))
    }

    pub async fn send_queued(&self, request: &QueuedRequest) -> Result<Value> {
        let req = self.build_request(request)?;
        debug!(
            id = %request.id,
            key = %request.idempotency_key,
            method = request.method.as_str(),
            url = %req.url(),
            "Replaying queued request"
        );
        self.execute(req).await
    }

    /// Authenticated `GET` returning JSON.
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.resolve_url(path);
        let mut builder = self.client.get(&url);
        if let Some(auth) = self.authorization() {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let req = builder.build().map_err(|e| friendly_error(&url, &e))?;
        self.execute(req).await
    }

    /// `GET {base}/api/health`; any 2xx within the health timeout is online.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(latency_ms = start.elapsed().as_millis() as u64, "health check ok");
                true
            }
            Ok(resp) => {
                info!(status = resp.status().as_u16(), "health check rejected");
                false
            }
            Err(e) => {
                debug!(error = %friendly_error(&self.base_url, &e), "health check failed");
                false
            }
        }
    }
}

impl RequestSender for ApiClient {
    async fn send(&self, request: &QueuedRequest) -> Result<Value> {
        self.send_queued(request).await
    }

    async fn check_health(&self) -> bool {
        self.health().await
    }
}
