//! Session metrics
//!
//! Emitted through the `metrics` facade; the host decides whether and how to
//! export them. Without an installed recorder every call is a no-op.
//!
//! - `session_refresh_total` (counter): label `outcome`
//! - `session_refresh_joined_total` (counter): callers that awaited an in-flight refresh
//! - `session_auth_retry_total` (counter): requests retried after a 401
//! - `session_requests_total` (counter): labels `method`, `status`

/// Result of one refresh network attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    Failure,
    /// No refresh token was available; no network call was made
    NoToken,
}

impl RefreshOutcome {
    pub fn label(self) -> &'static str {
        match self {
            RefreshOutcome::Success => "success",
            RefreshOutcome::Failure => "failure",
            RefreshOutcome::NoToken => "no_token",
        }
    }
}

pub fn record_refresh(outcome: RefreshOutcome) {
    metrics::counter!("session_refresh_total", "outcome" => outcome.label()).increment(1);
}

pub fn record_refresh_joined() {
    metrics::counter!("session_refresh_joined_total").increment(1);
}

pub fn record_auth_retry() {
    metrics::counter!("session_auth_retry_total").increment(1);
}

pub fn record_request(method: &str, status: u16) {
    metrics::counter!(
        "session_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
