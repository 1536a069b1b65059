//! In-memory credential triple with a durable refresh token
//!
//! The store is the single source of truth for the current session's
//! tokens. Every mutation updates the triple, persists (or removes) the
//! refresh token, and notifies subscribers while holding one tokio Mutex, so a
//! concurrently scheduled reader never observes a half-applied update and
//! two notifications never interleave.
//!
//! The access token is never persisted. After a restart only the refresh
//! token is available (via `get_refresh()`), which is enough for the refresh
//! coordinator to mint a new access token.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{EXPIRY_MARGIN, MAX_TOKEN_LIFETIME, REFRESH_TOKEN_KEY};
use crate::storage::KeyValueStorage;
use crate::subscribers::{SubscriberRegistry, Subscription};

/// Access and refresh tokens are set and cleared together.
#[derive(Default)]
struct Credentials {
    access: Option<Secret>,
    refresh: Option<Secret>,
    expires_at: Option<Instant>,
}

/// Current session credentials.
pub struct TokenStore {
    state: Mutex<Credentials>,
    storage: Arc<dyn KeyValueStorage>,
    subscribers: SubscriberRegistry,
}

impl TokenStore {
    /// Empty store. Nothing is read from `storage` until `get_refresh()`.
    pub fn new(storage: Arc<dyn KeyValueStorage>, subscribers: SubscriberRegistry) -> Self {
        Self {
            state: Mutex::new(Credentials::default()),
            storage,
            subscribers,
        }
    }

    /// Store a fresh token pair.
    ///
    /// `expires_in` is the server's lifetime in seconds; the token is treated
    /// as expired `EXPIRY_MARGIN` earlier. A lifetime shorter than the margin
    /// yields a token that is already invalid; one longer than
    /// `MAX_TOKEN_LIFETIME` is clamped.
    pub async fn set(
        &self,
        access: impl Into<Secret>,
        refresh: impl Into<Secret>,
        expires_in: u64,
    ) {
        let lifetime = Duration::from_secs(expires_in)
            .saturating_sub(EXPIRY_MARGIN)
            .min(MAX_TOKEN_LIFETIME);
        let refresh = refresh.into();

        let mut state = self.state.lock().await;
        state.access = Some(access.into());
        state.expires_at = Some(Instant::now() + lifetime);
        if let Err(e) = self
            .storage
            .set(REFRESH_TOKEN_KEY, refresh.expose_str())
            .await
        {
            warn!(error = %e, "failed to persist refresh token");
        }
        state.refresh = Some(refresh);
        debug!(expires_in, effective_secs = lifetime.as_secs(), "stored credentials");
        self.subscribers.notify(true);
    }

    /// Drop all credentials, in memory and on disk.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = Credentials::default();
        if let Err(e) = self.storage.remove(REFRESH_TOKEN_KEY).await {
            warn!(error = %e, "failed to remove persisted refresh token");
        }
        debug!("cleared credentials");
        self.subscribers.notify(false);
    }

    /// True iff an access token is held and its (margin-adjusted) expiry is
    /// still in the future.
    pub async fn is_valid(&self) -> bool {
        let state = self.state.lock().await;
        match (&state.access, state.expires_at) {
            (Some(_), Some(expires_at)) => Instant::now() < expires_at,
            _ => false,
        }
    }

    /// Current access token, expired or not.
    pub async fn get(&self) -> Option<Secret> {
        self.state.lock().await.access.clone()
    }

    /// Refresh token from memory, falling back to durable storage.
    ///
    /// The fallback covers a restart before any `set()`. A storage read
    /// failure is logged and treated as "no refresh token".
    pub async fn get_refresh(&self) -> Option<Secret> {
        if let Some(refresh) = self.state.lock().await.refresh.clone() {
            return Some(refresh);
        }
        match self.storage.get(REFRESH_TOKEN_KEY).await {
            Ok(persisted) => persisted.map(Secret::new),
            Err(e) => {
                warn!(error = %e, "failed to read persisted refresh token");
                None
            }
        }
    }

    /// Time left before the access token is treated as expired.
    pub async fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state.access.as_ref()?;
        state
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Register an auth-state observer.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribers.on_change(callback)
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }
}
