// Transport seam
// Network calls return a tagged outcome instead of raising

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use serde_json::Value;
use std::time::Duration;

use crate::error::SessionError;

/// A call to the booking API, relative to the transport's base URL
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Insert or replace a header (names compare case-insensitively)
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Structured result of a transport call
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    /// 2xx with its JSON body (`Null` when empty)
    Ok(Value),

    /// 401-equivalent
    Unauthorized,

    /// No response received
    NetworkError(String),

    /// Any other non-success response
    ServerError { status: u16, message: String },
}

impl TransportOutcome {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportOutcome::Unauthorized)
    }

    /// Convert into a plain result; `Unauthorized` maps to `SessionError::Unauthorized`
    pub fn into_result(self) -> std::result::Result<Value, SessionError> {
        match self {
            TransportOutcome::Ok(value) => Ok(value),
            TransportOutcome::Unauthorized => Err(SessionError::Unauthorized),
            TransportOutcome::NetworkError(msg) => Err(SessionError::NetworkError(msg)),
            TransportOutcome::ServerError { status, message } => {
                Err(SessionError::ServerError { status, message })
            }
        }
    }
}

/// Performs network calls for the session layer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> TransportOutcome;
}

/// reqwest-backed transport for the booking API
pub struct HttpTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API root every request path is joined onto
    base_url: Url,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid API base URL: {}", base_url))?;

        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> TransportOutcome {
        let url = self.url_for(&request.path);
        tracing::debug!(method = %request.method, url = %url, "Sending HTTP request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                return TransportOutcome::NetworkError(format!("{} ({})", e, error_kind));
            }
        };

        let status = response.status();
        tracing::debug!(status = %status, "Received HTTP response");

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return TransportOutcome::Unauthorized;
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "Failed to read response body");
                return TransportOutcome::NetworkError(format!("{} (body_error)", e));
            }
        };

        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                url = %url,
                response_body = %text,
                "HTTP request failed with error response"
            );
            return TransportOutcome::ServerError {
                status: status.as_u16(),
                message: text,
            };
        }

        if text.trim().is_empty() {
            return TransportOutcome::Ok(Value::Null);
        }

        match serde_json::from_str(&text) {
            Ok(value) => TransportOutcome::Ok(value),
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "Response body is not JSON");
                TransportOutcome::ServerError {
                    status: status.as_u16(),
                    message: format!("Invalid JSON response: {}", e),
                }
            }
        }
    }
}
