//! Wire paths and lifecycle constants
//!
//! Paths are relative to the API base URL (e.g. `https://host/api/v1`).

use std::time::Duration;

/// Exchanges a refresh token for a new access token
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Username/password login
pub const LOGIN_PATH: &str = "/auth/login";

/// Revokes the refresh token server-side
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Storage key under which the refresh token is persisted
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Subtracted from `expires_in` so a token is treated as expired before the
/// server starts rejecting it.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Longest access-token lifetime honored from `expires_in`. Larger values
/// are clamped so the expiry instant cannot overflow.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
