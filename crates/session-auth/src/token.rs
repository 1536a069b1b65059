//! Token endpoint calls
//!
//! Two unauthenticated interactions with the API's auth routes:
//! 1. Login (username/password → initial token pair)
//! 2. Refresh (refresh token → new access token, optionally a rotated refresh token)
//!
//! Both POST JSON to paths under the API base URL and decode the same
//! `TokenResponse` shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{LOGIN_PATH, REFRESH_PATH};
use crate::error::{Error, Result};

/// Response from the login and refresh endpoints.
///
/// `expires_in` is a delta in seconds from the response time. `refresh_token`
/// is optional on refresh: servers that do not rotate refresh tokens omit it,
/// and the caller keeps the one it already holds.
#[derive(Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: u64,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Join an API base URL and an absolute route path.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Exchange a refresh token for a new access token.
///
/// Any non-2xx status means the refresh token is invalid or expired; the
/// caller decides what to do with the session.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    debug!(path = REFRESH_PATH, "requesting token refresh");
    post_for_tokens(
        client,
        &endpoint(base_url, REFRESH_PATH),
        &RefreshRequest {
            refresh_token: refresh,
        },
    )
    .await
}

/// Log in with username and password.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<TokenResponse> {
    debug!(path = LOGIN_PATH, username, "requesting login");
    post_for_tokens(
        client,
        &endpoint(base_url, LOGIN_PATH),
        &LoginRequest { username, password },
    )
    .await
}

async fn post_for_tokens<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<TokenResponse> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Decode(e.to_string()))
}
