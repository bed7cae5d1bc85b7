//! Legacy request/response client.
//!
//! Older coordinator endpoints take a zlib-compressed JSON `POST` per call.
//! Responses are handled by status:
//!
//! - 2xx: success, the body is parsed as JSON
//! - 404 and 5xx: retried against the same URL
//! - any other 4xx: fails at once
//! - no response at all: retried against the other URL
//!
//! The actual network call sits behind [`HttpSend`] so the retry rules can be
//! exercised without a server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use miniz_oxide::deflate::compress_to_vec_zlib;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::retry::{RetryPolicy, UrlRotation, with_retry};
use crate::settings::Settings;

/// zlib compression level for request bodies.
const COMPRESSION_LEVEL: u8 = 6;

/// Raw response as seen by the retry logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One `POST` round trip. `Err` means no response was received.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> std::result::Result<HttpResponse, String>;
}

/// [`HttpSend`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestSend {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestSend {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HttpSend for ReqwestSend {
    async fn post(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> std::result::Result<HttpResponse, String> {
        let mut request = self.client.post(url).timeout(self.timeout).body(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            request_id,
            body: body.to_vec(),
        })
    }
}

/// Identity and endpoints of the legacy client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Primary first, then fallback.
    pub urls: Vec<String>,
    pub api_key: Option<String>,
    pub build_id: Option<String>,
    pub build_node: String,
    pub client_name: String,
    pub client_version: String,
    pub retry: RetryPolicy,
}

impl HttpConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            urls: settings.http_urls(),
            api_key: settings.api_key.clone(),
            build_id: settings.build_id.clone(),
            build_node: settings.build_node.clone(),
            client_name: settings.client_name.clone(),
            client_version: settings.client_version.clone(),
            retry: RetryPolicy::new(
                settings.api_retry_limit,
                Duration::from_secs(settings.api_timeout),
            ),
        }
    }
}

/// Compressed JSON `POST`s with retry and URL fail-over.
pub struct HttpClient {
    config: HttpConfig,
    urls: Mutex<UrlRotation>,
    sender: Arc<dyn HttpSend>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("urls", &self.config.urls)
            .field("retry", &self.config.retry)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Client over `reqwest` using the configured timeout.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        let sender = Arc::new(ReqwestSend::new(config.retry.timeout));
        Self::with_sender(config, sender)
    }

    #[must_use]
    pub fn with_sender(config: HttpConfig, sender: Arc<dyn HttpSend>) -> Self {
        Self {
            urls: Mutex::new(UrlRotation::new(config.urls.clone())),
            config,
            sender,
        }
    }

    /// Same endpoints and identity with a different retry policy.
    #[must_use]
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        let mut config = self.config.clone();
        config.retry = retry;
        Self::with_sender(config, Arc::clone(&self.sender))
    }

    fn urls(&self) -> MutexGuard<'_, UrlRotation> {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Base URL the next request goes to.
    pub fn current_url(&self) -> Option<String> {
        self.urls().current().map(str::to_string)
    }

    fn headers(&self, attempt: u32) -> Vec<(&'static str, String)> {
        let config = &self.config;
        vec![
            ("Accept", "application/json".to_string()),
            ("Authorization", config.api_key.clone().unwrap_or_default()),
            ("Content-Encoding", "deflate".to_string()),
            ("Content-Type", "application/json".to_string()),
            (
                "User-Agent",
                format!("{}/{}", config.client_name, config.client_version),
            ),
            ("X-Build-Id", config.build_id.clone().unwrap_or_default()),
            ("X-Build-Node", config.build_node.clone()),
            ("X-Attempt", attempt.to_string()),
        ]
    }

    async fn attempt(&self, path: &str, body: Vec<u8>, attempt: u32) -> Result<Value> {
        let base = self
            .current_url()
            .ok_or_else(|| Error::Runtime("no server URL configured".into()))?;
        let url = format!("{base}{path}");
        debug!(url = %url, attempt, "sending request");

        let response = match self.sender.post(&url, &self.headers(attempt), body).await {
            Ok(response) => response,
            Err(reason) => {
                // no response: try the other endpoint next
                self.urls().rotate();
                return Err(TransportError::Connect { url, reason }.into());
            }
        };
        if !response.is_success() {
            return Err(ProtocolError::Status {
                status: response.status,
                request_id: response.request_id.unwrap_or_default(),
            }
            .into());
        }
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// `POST` `payload` to `path` (e.g. `/heartbeat`).
    pub async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        let body = compress_to_vec_zlib(&serde_json::to_vec(payload)?, COMPRESSION_LEVEL);
        with_retry(&self.config.retry, |attempt| {
            self.attempt(path, body.clone(), attempt)
        })
        .await
        .map_err(|err| {
            let detail = match err {
                Error::Protocol(status @ ProtocolError::Status { .. }) => status.to_string(),
                Error::Transport(TransportError::Connect { reason, .. }) => reason,
                other => other.to_string(),
            };
            Error::from(TransportError::Communication(detail))
        })
    }
}
