//! Request error taxonomy
//!
//! Every failed call resolves to exactly one of:
//! - `Transport`: the exchange itself failed (network, undecodable 2xx body)
//! - `AuthExpired`: the session could not be (re)authenticated and was cleared
//! - `Api`: the server answered non-2xx; carries its error envelope
//! - `InvalidRequest` / `Config`: rejected locally before any I/O
//! - `Storage`: the durable token store failed

use std::collections::BTreeMap;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Deserialize;

/// Header carrying the server's request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Structured error returned by the API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{status} {code}: {message}")]
pub struct ApiError {
    /// HTTP status of the response
    pub status: u16,
    /// Machine-readable code (`error` in the envelope)
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    /// Field-level details, when the server supplies them
    pub details: Option<BTreeMap<String, serde_json::Value>>,
}

/// Wire shape of a non-2xx body.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    status_code: Option<u16>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    details: Option<BTreeMap<String, serde_json::Value>>,
}

impl ApiError {
    /// Build from a non-2xx status and its raw body.
    ///
    /// Bodies that are not the JSON error envelope are replaced by a
    /// synthesized error whose message is the status' reason phrase. The
    /// `x-request-id` response header fills in a request id the body lacks.
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let header_request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => Self {
                status: status.as_u16(),
                code: envelope.error,
                message: envelope.message,
                request_id: envelope.request_id.or(header_request_id),
                details: envelope.details,
            },
            Err(_) => Self::synthesized(status, header_request_id),
        }
    }

    fn synthesized(status: StatusCode, request_id: Option<String>) -> Self {
        Self {
            status: status.as_u16(),
            code: format!("http_{}", status.as_u16()),
            message: status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_owned(),
            request_id,
            details: None,
        }
    }

    /// Read the body of a non-2xx response and convert it.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();
        Self::from_parts(status, &headers, &body)
    }
}

/// Errors from request execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("session expired: {0}")]
    AuthExpired(ApiError),

    #[error("API error: {0}")]
    Api(ApiError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The durable token store could not be read or written
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// HTTP status when the server answered, `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        self.api_error().map(|e| e.status)
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::AuthExpired(e) | Error::Api(e) => Some(e),
            _ => None,
        }
    }

    /// The session was cleared; the host should prompt for login.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Error::AuthExpired(_))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(status) if status >= 500)
    }
}

impl From<session_auth::Error> for Error {
    fn from(err: session_auth::Error) -> Self {
        match err {
            session_auth::Error::Rejected { status, body } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Error::Api(ApiError::from_parts(status, &HeaderMap::new(), body.as_bytes()))
            }
            session_auth::Error::Http(msg) | session_auth::Error::Decode(msg) => {
                Error::Transport(msg)
            }
            session_auth::Error::Storage(msg) => Error::Storage(msg),
        }
    }
}

/// Result alias for request operations.
pub type Result<T> = std::result::Result<T, Error>;
