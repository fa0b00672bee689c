use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when using the Z.ai API client
///
/// Transport errors are shared behind an [`Arc`], which keeps the enum `Clone`.
#[derive(Debug, Clone, Error)]
pub enum ZaiError {
    /// Invalid or missing construction input
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Empty or malformed `id.secret` credential
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Token signing or claim encoding failed
    #[error("Token signing failed: {0}")]
    Signing(String),

    /// Transport failed before any response bytes arrived
    #[error("Connection error: {0}")]
    Connection(#[source] Arc<reqwest::Error>),

    /// Request exceeded an imposed deadline
    #[error("Request timed out: {0}")]
    Timeout(#[source] Arc<reqwest::Error>),

    /// Any other HTTP-layer failure (request building, body read)
    #[error("HTTP error: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    /// HTTP 400
    #[error("Bad request: {0}")]
    BadRequest(ApiErrorObject),

    /// HTTP 401
    #[error("Authentication failed: {0}")]
    Authentication(ApiErrorObject),

    /// HTTP 429
    #[error("Rate limited: {error}")]
    RateLimit {
        /// Error details from the body
        error: ApiErrorObject,
        /// Delay advertised by `Retry-After`, if any
        retry_after: Option<Duration>,
    },

    /// HTTP 500
    #[error("Internal server error: {0}")]
    InternalServer(ApiErrorObject),

    /// HTTP 503
    #[error("Server overloaded: {0}")]
    ServerOverloaded(ApiErrorObject),

    /// Any other non-2xx status
    #[error("API error: {0}")]
    Api(ApiErrorObject),

    /// 2xx response whose body does not match the expected schema
    #[error("Response validation failed: {0}")]
    ResponseValidation(String),

    /// Malformed event stream (oversized line, invalid UTF-8, read failure)
    #[error("SSE error: {0}")]
    Sse(String),

    /// Operation on a closed stream
    #[error("stream closed")]
    StreamClosed,

    /// The caller's cancellation token fired
    #[error("request cancelled")]
    Cancelled,

    /// A retry needed to replay a request body that could not be cloned
    #[error("request body cannot be replayed for retry")]
    NonRetryableBody,

    /// A request or response middleware rejected the call
    #[error("Middleware error: {0}")]
    Middleware(String),
}

/// Credential validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The credential string was empty
    #[error("credential is empty")]
    Empty,
    /// The credential is not of the form `<id>.<secret>`
    #[error("credential must be of the form <id>.<secret>")]
    Invalid,
}

/// API error object returned by the platform
///
/// The wire shape is `{"error": {"code": "...", "message": "..."}}`. The status is
/// filled in from the HTTP response, not the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorObject {
    /// HTTP status code
    #[serde(default)]
    pub status: u16,
    /// Platform error code (e.g. `"1214"`)
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable error message
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ApiErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {} (code {code})", self.status, self.message),
            None => write!(f, "[{}] {}", self.status, self.message),
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

impl From<reqwest::Error> for ZaiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Arc::new(e))
        } else if e.is_connect() {
            Self::Connection(Arc::new(e))
        } else {
            Self::Http(Arc::new(e))
        }
    }
}

impl ZaiError {
    /// Classifies a non-2xx response into the error taxonomy
    ///
    /// Parses the platform error envelope when present, falling back to a capped
    /// snippet of the raw body.
    #[must_use]
    pub fn from_response_parts(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let error = api_error_object(status, body);
        match status.as_u16() {
            400 => Self::BadRequest(error),
            401 => Self::Authentication(error),
            429 => Self::RateLimit {
                error,
                retry_after: crate::retry::parse_retry_after(headers),
            },
            500 => Self::InternalServer(error),
            503 => Self::ServerOverloaded(error),
            _ => Self::Api(error),
        }
    }

    /// Returns the HTTP status for API status errors
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest(e)
            | Self::Authentication(e)
            | Self::RateLimit { error: e, .. }
            | Self::InternalServer(e)
            | Self::ServerOverloaded(e)
            | Self::Api(e) => Some(e.status),
            _ => None,
        }
    }

    /// Returns true if the error is the caller's cancellation
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn api_error_object(status: StatusCode, body: &[u8]) -> ApiErrorObject {
    let status = status.as_u16();

    if let Ok(env) = serde_json::from_slice::<ErrorEnvelope>(body) {
        let code = env.error.code.map(|c| match c {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        return ApiErrorObject {
            status,
            code,
            message: env.error.message,
        };
    }

    // Gateways may return plain text or HTML; cap body to avoid log/memory bloat
    ApiErrorObject {
        status,
        code: None,
        message: snippet(body),
    }
}

/// Maps a serde deserialization error to a `ZaiError` with body context
#[must_use]
pub fn map_deser(e: &serde_json::Error, body: &[u8]) -> ZaiError {
    ZaiError::ResponseValidation(format!("{e}: {}", snippet(body)))
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(400)]).into_owned()
}
