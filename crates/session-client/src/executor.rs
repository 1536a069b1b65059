//! Request execution with one-shot refresh-and-retry
//!
//! Each call walks a small state machine:
//!
//! ```text
//! NeedsAuth --ensure()--> Valid --2xx/204--> done
//!                           |--non-401 / no auth--> Api error
//!                           |--401, retries left, refresh token--> Refreshing
//!                           |--401 otherwise--> Failed
//! Refreshing --refresh ok--> NeedsAuth
//!            --refresh failed--> Failed
//! Failed --> AuthExpired error
//! ```
//!
//! The retry counter is bounded by `MAX_AUTH_RETRIES`, so a server that keeps
//! answering 401 costs one refresh and two requests, never a loop.

use std::sync::Arc;

use common::Secret;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};
use session_auth::TokenStore;
use tracing::{debug, instrument, warn};

use crate::error::{ApiError, Error, REQUEST_ID_HEADER, Result};
use crate::metrics;
use crate::refresh::RefreshCoordinator;
use crate::request::{ApiResponse, Query, RequestBody, RequestOptions};

/// Automatic retries after a 401. Fixed at one.
pub const MAX_AUTH_RETRIES: u32 = 1;

enum AuthPhase {
    /// Token must be validated (and possibly refreshed) before sending
    NeedsAuth,
    /// Ready to send with this token (`None` for unauthenticated sends)
    Valid(Option<Secret>),
    /// The server rejected the token; one forced refresh is allowed
    Refreshing(ApiError),
    /// Re-authentication is impossible
    Failed(ApiError),
}

/// Issues API calls for one session.
pub struct RequestExecutor {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    refresh: Arc<RefreshCoordinator>,
}

impl RequestExecutor {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenStore>,
        refresh: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
            refresh,
        }
    }

    /// Build the target URL: base + path + ordered query string.
    pub fn url(&self, path: &str, query: &Query) -> Result<Url> {
        let raw = session_auth::token::endpoint(&self.base_url, path);
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::InvalidRequest(format!("invalid URL {raw}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.pairs());
        }
        Ok(url)
    }

    /// Send one API call, refreshing and retrying once on a 401.
    #[instrument(skip_all, fields(method = %method, path = %path))]
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<&RequestBody>,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.url(path, query)?;
        let use_auth = !options.no_auth;
        let mut retries = 0;
        let mut phase = if use_auth {
            AuthPhase::NeedsAuth
        } else {
            AuthPhase::Valid(None)
        };

        loop {
            phase = match phase {
                AuthPhase::NeedsAuth => {
                    if !self.refresh.ensure().await {
                        debug!("no valid token obtainable, sending without one");
                    }
                    AuthPhase::Valid(self.tokens.get().await)
                }
                AuthPhase::Valid(token) => {
                    let response = self
                        .send(&method, &url, body, token.as_ref(), options)
                        .await?;
                    let status = response.status();
                    metrics::record_request(method.as_str(), status.as_u16());

                    if status == StatusCode::NO_CONTENT {
                        return Ok(ApiResponse::Empty);
                    }
                    if status.is_success() {
                        return finish(response, options).await;
                    }

                    let error = ApiError::from_response(response).await;
                    if status != StatusCode::UNAUTHORIZED || !use_auth {
                        return Err(Error::Api(error));
                    }
                    if retries >= MAX_AUTH_RETRIES {
                        warn!(retries, "token rejected after refresh, giving up");
                        self.expire_session().await;
                        AuthPhase::Failed(error)
                    } else if self.tokens.get_refresh().await.is_none() {
                        debug!("token rejected and no refresh token held");
                        self.expire_session().await;
                        AuthPhase::Failed(error)
                    } else {
                        retries += 1;
                        AuthPhase::Refreshing(error)
                    }
                }
                AuthPhase::Refreshing(error) => {
                    if self.refresh.force_refresh().await {
                        metrics::record_auth_retry();
                        debug!(attempt = retries, "retrying with refreshed token");
                        AuthPhase::NeedsAuth
                    } else {
                        AuthPhase::Failed(error)
                    }
                }
                AuthPhase::Failed(error) => return Err(Error::AuthExpired(error)),
            };
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&RequestBody>,
        token: Option<&Secret>,
        options: &RequestOptions,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(
                REQUEST_ID_HEADER,
                format!("req_{}", uuid::Uuid::new_v4().as_simple()),
            );

        if let Some(token) = token {
            request = request.bearer_auth(token.expose_str());
        }

        request = match body {
            Some(RequestBody::Json(value)) => request.json(value),
            Some(RequestBody::Bytes { data, content_type }) => {
                let request = request.body(data.clone());
                match content_type {
                    Some(content_type) => request.header(CONTENT_TYPE, content_type.as_str()),
                    None => request,
                }
            }
            None => request,
        };

        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{method} {}: {e}", url.path())))
    }

    /// Clear credentials after an unrecoverable 401, unless a failed refresh
    /// already did.
    async fn expire_session(&self) {
        if self.tokens.get().await.is_some() {
            self.tokens.clear().await;
        }
    }
}

async fn finish(response: reqwest::Response, options: &RequestOptions) -> Result<ApiResponse> {
    if options.raw {
        return Ok(ApiResponse::Raw(response));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Transport(format!("reading response body: {e}")))?;
    if body.is_empty() {
        return Ok(ApiResponse::Empty);
    }
    serde_json::from_slice(&body)
        .map(ApiResponse::Json)
        .map_err(|e| Error::Transport(format!("decoding response body: {e}")))
}
