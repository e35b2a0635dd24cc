//! The narrow interface the core uses to reach the backend.
//!
//! A [`Transport`] performs exactly one network call per `send` and reports
//! transport-level failures as a [`TransportError`] carrying a
//! [`TransportErrorCode`]. Everything above it (dedup, timeouts, retries)
//! lives in the request manager and recovery service.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn allows_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json<T: Serialize>(url: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(serde_json::to_string(payload)?),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorCode {
    ConnectionRefused,
    NameNotResolved,
    Reset,
    Timeout,
    Proxy,
    Other,
}

impl TransportErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorCode::ConnectionRefused => "connection refused",
            TransportErrorCode::NameNotResolved => "name not resolved",
            TransportErrorCode::Reset => "connection reset",
            TransportErrorCode::Timeout => "timed out",
            TransportErrorCode::Proxy => "proxy error",
            TransportErrorCode::Other => "transport error",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single call. Implementations should stop work promptly once
    /// `cancel` fires.
    async fn send(
        &self,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_json_sets_content_type_and_body() {
        let spec = RequestSpec::post_json(
            "http://localhost:8000/api/chat",
            &serde_json::json!({"message": "hi"}),
        )
        .expect("serializable");

        assert_eq!(spec.method, Method::Post);
        assert_eq!(spec.body.as_deref(), Some(r#"{"message":"hi"}"#));
        assert_eq!(
            spec.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let mut response = TransportResponse::new(429, "");
        response
            .headers
            .push(("Retry-After".to_string(), "12".to_string()));

        assert_eq!(response.header("retry-after"), Some("12"));
        assert!(!response.is_success());
    }

    #[test]
    fn transport_error_display_includes_code() {
        let err = TransportError::new(TransportErrorCode::ConnectionRefused, "127.0.0.1:8000");
        assert_eq!(err.to_string(), "connection refused: 127.0.0.1:8000");
    }
}
