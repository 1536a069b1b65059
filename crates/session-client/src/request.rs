//! Request and response value types

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Ordered query parameters. Absent (`None`) values are skipped, so optional
/// filters can be passed straight through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// Append `key=value` only when `value` is `Some`.
    pub fn opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Request payload. Cheap to clone so the body can be re-sent on retry.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Serialized as JSON with `Content-Type: application/json`
    Json(serde_json::Value),
    /// Opaque bytes; no JSON content type is added
    Bytes {
        data: Bytes,
        content_type: Option<String>,
    },
}

impl RequestBody {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(RequestBody::Json)
            .map_err(|e| Error::InvalidRequest(format!("serializing request body: {e}")))
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        RequestBody::Bytes {
            data: data.into(),
            content_type: None,
        }
    }

    /// Opaque bytes with an explicit content type (e.g. `image/jpeg`).
    pub fn bytes_with_type(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        RequestBody::Bytes {
            data: data.into(),
            content_type: Some(content_type.into()),
        }
    }
}

/// Per-call switches.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Skip token validation and the `Authorization` header
    pub no_auth: bool,
    /// Hand back the transport response instead of parsing JSON
    pub raw: bool,
    /// Per-request timeout, overriding the client's default
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Successful outcome of `execute`.
#[derive(Debug)]
pub enum ApiResponse {
    /// `204 No Content` (or an empty 2xx body)
    Empty,
    Json(serde_json::Value),
    /// Unparsed response, returned when `RequestOptions::raw` is set
    Raw(reqwest::Response),
}

impl ApiResponse {
    /// Decode into `T`. `Empty` decodes from JSON `null`, so `()` and
    /// `Option<T>` accept a 204.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        let value = match self {
            ApiResponse::Empty => serde_json::Value::Null,
            ApiResponse::Json(value) => value,
            ApiResponse::Raw(_) => {
                return Err(Error::InvalidRequest(
                    "raw response requested; decode it from the transport response".into(),
                ));
            }
        };
        serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("decoding response body: {e}")))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ApiResponse::Empty)
    }
}
