//! Transport used to open long-lived streaming requests.
//!
//! The supervisor only depends on the [`Transport`] trait; [`HttpTransport`]
//! is the default `reqwest` implementation.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use reqwest::header::{AUTHORIZATION, CONNECTION};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::StreamConfig;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Live response body as a stream of raw byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// One streaming connection attempt.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Query parameters for GET, form parameters for POST.
    pub params: Vec<(String, String)>,
    pub credentials: Option<SecretString>,
    /// Idle read timeout that replaces the normal request timeout.
    pub read_timeout: Duration,
}

/// Established response whose body is still being received.
pub struct LiveBody {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl LiveBody {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self { status, body }
    }
}

impl fmt::Debug for LiveBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveBody")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Opens `request` and resolves once response headers were received.
    ///
    /// Non-2xx responses must resolve to [`TransportError::HttpStatus`].
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<LiveBody, TransportError>>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

impl TransportError {
    /// HTTP status carried by the failure, if the server answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(err) => err.status(),
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Network(_) => None,
        }
    }
}

/// `reqwest` backed transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig) -> Result<Self, TransportError> {
        // No total request timeout: the body is read for as long as the
        // stream stays up and idle reads are bounded by the frame reader.
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(TransportError::Request)?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: StreamRequest) -> BoxFuture<'static, Result<LiveBody, TransportError>> {
        open_attempt(self.http.clone(), request).boxed()
    }
}

async fn open_attempt(http: Client, request: StreamRequest) -> Result<LiveBody, TransportError> {
    debug!(
        event = "transport_open",
        method = %request.method,
        url = %request.url
    );

    let mut builder = match request.method {
        HttpMethod::Get => http.get(&request.url).query(&request.params),
        HttpMethod::Post => http.post(&request.url).form(&request.params),
    };
    builder = builder.header(CONNECTION, "close");
    if let Some(credentials) = request.credentials.as_ref() {
        builder = builder.header(AUTHORIZATION, credentials.expose_secret().as_str());
    }

    let response = builder.send().await.map_err(TransportError::Request)?;
    let status = response.status();

    if !status.is_success() {
        let body = tokio::time::timeout(request.read_timeout, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        return Err(TransportError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(TransportError::Request))
        .boxed();
    Ok(LiveBody::new(status, body))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ApiError {
        #[serde(default)]
        message: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<ApiError>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let first = parsed.errors.into_iter().find_map(|error| error.message);
        if let Some(message) = first
            .or(parsed.error)
            .or(parsed.message)
            .or(parsed.detail)
        {
            return message;
        }
    }

    body.trim().chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{summarize_error_body, TransportError, ERROR_BODY_SNIPPET_LEN};

    #[test]
    fn summary_prefers_api_error_message() {
        let body = r#"{"errors":[{"code":32,"message":"Could not authenticate you."}]}"#;
        assert_eq!(summarize_error_body(body), "Could not authenticate you.");
    }

    #[test]
    fn summary_falls_back_to_detail() {
        let body = r#"{"title":"Unauthorized","detail":"Unauthorized"}"#;
        assert_eq!(summarize_error_body(body), "Unauthorized");
    }

    #[test]
    fn summary_truncates_plain_text() {
        let body = "x".repeat(1000);
        assert_eq!(summarize_error_body(&body).len(), ERROR_BODY_SNIPPET_LEN);
    }

    #[test]
    fn http_status_error_exposes_status() {
        let error = TransportError::HttpStatus {
            status: StatusCode::NOT_ACCEPTABLE,
            body: String::new(),
        };
        assert_eq!(error.status(), Some(StatusCode::NOT_ACCEPTABLE));
        assert_eq!(TransportError::Network("reset".to_string()).status(), None);
    }
}
