//! Single-flight access token refresh
//!
//! Many requests can discover an expired token at the same moment. The
//! coordinator collapses them onto one `POST /auth/refresh`: the first caller
//! spawns the refresh as its own task and parks a shared handle in the
//! pending slot; everyone else awaits that handle. The task empties the slot
//! before its result is published, so the next caller after completion
//! starts from a clean state.
//!
//! The refresh runs on a spawned task so that callers who stop waiting do not
//! cancel it. The slot is emptied even if the refresh panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::Secret;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use session_auth::TokenStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::metrics::{self, RefreshOutcome};

type PendingRefresh = Shared<BoxFuture<'static, bool>>;

/// Keeps the access token fresh with at most one refresh call in flight.
pub struct RefreshCoordinator {
    tokens: Arc<TokenStore>,
    http: reqwest::Client,
    base_url: String,
    pending: Arc<Mutex<Option<PendingRefresh>>>,
}

impl RefreshCoordinator {
    pub fn new(tokens: Arc<TokenStore>, http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            tokens,
            http,
            base_url: base_url.into(),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Make sure a valid access token is available.
    ///
    /// Returns `true` immediately when the current token is valid. Otherwise
    /// joins the in-flight refresh or starts one. `false` means no token
    /// could be obtained; after a failed refresh the session has been
    /// cleared.
    pub async fn ensure(&self) -> bool {
        if self.tokens.is_valid().await {
            return true;
        }
        self.refresh(false).await
    }

    /// Refresh even if the current token looks valid.
    ///
    /// Used after the server rejected a token with 401. Joins an in-flight
    /// refresh if there is one.
    pub async fn force_refresh(&self) -> bool {
        self.refresh(true).await
    }

    /// Whether a refresh call is currently outstanding.
    pub async fn is_refreshing(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    async fn refresh(&self, force: bool) -> bool {
        let pending = {
            let mut slot = self.pending.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!(force, "joining in-flight token refresh");
                    metrics::record_refresh_joined();
                    pending.clone()
                }
                None => {
                    // A refresh may have completed between the caller's
                    // validity check and acquiring the slot.
                    if !force && self.tokens.is_valid().await {
                        return true;
                    }
                    let pending = self.spawn_refresh();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    fn spawn_refresh(&self) -> PendingRefresh {
        let tokens = Arc::clone(&self.tokens);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let slot = Arc::clone(&self.pending);

        let task_slot = Arc::clone(&slot);
        let task = tokio::spawn(async move {
            let refreshed = AssertUnwindSafe(run_refresh(&tokens, &http, &base_url))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!("token refresh panicked");
                    false
                });
            task_slot.lock().await.take();
            refreshed
        });

        async move {
            match task.await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    // The task never reached its own cleanup
                    warn!(error = %e, "token refresh task aborted");
                    slot.lock().await.take();
                    false
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// One refresh round trip against the token store.
async fn run_refresh(tokens: &TokenStore, http: &reqwest::Client, base_url: &str) -> bool {
    let Some(current) = tokens.get_refresh().await else {
        debug!("no refresh token available, skipping refresh");
        metrics::record_refresh(RefreshOutcome::NoToken);
        return false;
    };

    debug!("refreshing access token");
    match session_auth::refresh_token(http, base_url, current.expose_str()).await {
        Ok(response) => {
            let rotated = response.refresh_token.is_some();
            let refresh = response
                .refresh_token
                .map(Secret::new)
                .unwrap_or(current);
            tokens
                .set(response.access_token, refresh, response.expires_in)
                .await;
            metrics::record_refresh(RefreshOutcome::Success);
            info!(rotated, expires_in = response.expires_in, "token refresh succeeded");
            true
        }
        Err(e) => {
            warn!(error = %e, "token refresh failed, clearing session");
            tokens.clear().await;
            metrics::record_refresh(RefreshOutcome::Failure);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockApi, recording_store};
    use session_auth::{KeyValueStorage, MemoryStorage, REFRESH_TOKEN_KEY};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn valid_token_skips_network() {
        let api = MockApi::start().await;
        let (tokens, _, _) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R1", 3600).await;

        let coordinator = RefreshCoordinator::new(tokens, reqwest::Client::new(), &api.base_url);
        assert!(coordinator.ensure().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_ensure_triggers_one_refresh() {
        let api = MockApi::start().await;
        api.set_refresh_delay_ms(50);
        let (tokens, _, _) = recording_store(MemoryStorage::with_entries([(
            REFRESH_TOKEN_KEY,
            "R1",
        )]));
        let coordinator = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            reqwest::Client::new(),
            &api.base_url,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move { coordinator.ensure().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(tokens.is_valid().await);
        assert_eq!(tokens.get().await.unwrap().expose_str(), "A-fresh-1");
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn sequential_refreshes_each_hit_network() {
        let api = MockApi::start().await;
        let (tokens, _, _) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R1", 3600).await;
        let coordinator = RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), &api.base_url);

        assert!(coordinator.force_refresh().await);
        assert!(coordinator.force_refresh().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.get().await.unwrap().expose_str(), "A-fresh-2");
    }

    #[tokio::test]
    async fn refresh_without_rotation_keeps_refresh_token() {
        let api = MockApi::start().await;
        let (tokens, storage, _) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R1", 3600).await;
        let coordinator = RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), &api.base_url);

        assert!(coordinator.force_refresh().await);
        assert_eq!(tokens.get_refresh().await.unwrap().expose_str(), "R1");
        assert_eq!(
            storage.get(REFRESH_TOKEN_KEY).await.unwrap().as_deref(),
            Some("R1")
        );
        assert_eq!(api.refresh_bodies()[0], serde_json::json!({"refresh_token": "R1"}));
    }

    #[tokio::test]
    async fn refresh_with_rotation_replaces_refresh_token() {
        let api = MockApi::start().await;
        api.set_rotation("R3");
        let (tokens, storage, _) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R1", 3600).await;
        let coordinator = RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), &api.base_url);

        assert!(coordinator.force_refresh().await);
        assert_eq!(tokens.get_refresh().await.unwrap().expose_str(), "R3");
        assert_eq!(
            storage.get(REFRESH_TOKEN_KEY).await.unwrap().as_deref(),
            Some("R3")
        );
    }

    #[tokio::test]
    async fn failed_refresh_clears_session_and_notifies_once() {
        let api = MockApi::start().await;
        api.reject_refresh();
        let (tokens, _, events) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R-revoked", 3600).await;
        events.lock().unwrap().clear();
        let coordinator = Arc::new(RefreshCoordinator::new(
            tokens.clone(),
            reqwest::Client::new(),
            &api.base_url,
        ));

        let (a, b, c) = tokio::join!(
            coordinator.force_refresh(),
            coordinator.force_refresh(),
            coordinator.force_refresh()
        );
        assert!(!a && !b && !c);

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(!tokens.is_valid().await);
        assert!(tokens.get().await.is_none());
        assert!(tokens.get_refresh().await.is_none());
        assert_eq!(*events.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn failed_refresh_is_not_retried() {
        let api = MockApi::start().await;
        api.reject_refresh();
        let (tokens, _, _) = recording_store(MemoryStorage::with_entries([(
            REFRESH_TOKEN_KEY,
            "R-revoked",
        )]));
        let coordinator = RefreshCoordinator::new(tokens, reqwest::Client::new(), &api.base_url);

        assert!(!coordinator.ensure().await);
        // Session is now empty: the next ensure has nothing to send
        assert!(!coordinator.ensure().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_refresh_token_means_no_network_and_no_transition() {
        let api = MockApi::start().await;
        let (tokens, _, events) = recording_store(MemoryStorage::new());
        let coordinator = RefreshCoordinator::new(tokens, reqwest::Client::new(), &api.base_url);

        assert!(!coordinator.ensure().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_clears_session() {
        let (tokens, _, events) = recording_store(MemoryStorage::new());
        tokens.set("A1", "R1", 3600).await;
        events.lock().unwrap().clear();
        let coordinator =
            RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), "http://127.0.0.1:9");

        assert!(!coordinator.force_refresh().await);
        assert!(tokens.get().await.is_none());
        assert_eq!(*events.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn panicking_refresh_releases_the_slot() {
        let api = MockApi::start().await;
        let (tokens, _, _) = recording_store(MemoryStorage::with_entries([(
            REFRESH_TOKEN_KEY,
            "R1",
        )]));
        let panicked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = panicked.clone();
        tokens
            .on_change(move |_| {
                if !flag.swap(true, Ordering::SeqCst) {
                    panic!("subscriber failure");
                }
            })
            .detach();
        let coordinator = RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), &api.base_url);

        assert!(!coordinator.ensure().await);
        assert!(!coordinator.is_refreshing().await);

        // Force the next ensure onto the network again
        tokens.clear().await;
        tokens.set("A-old", "R1", 1).await;
        assert!(coordinator.ensure().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 2);
        assert_eq!(tokens.get().await.unwrap().expose_str(), "A-fresh-2");
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_refresh() {
        let api = MockApi::start().await;
        api.set_refresh_delay_ms(100);
        let (tokens, _, _) = recording_store(MemoryStorage::with_entries([(
            REFRESH_TOKEN_KEY,
            "R1",
        )]));
        let coordinator = RefreshCoordinator::new(tokens.clone(), reqwest::Client::new(), &api.base_url);

        let gave_up = tokio::time::timeout(std::time::Duration::from_millis(10), coordinator.ensure()).await;
        assert!(gave_up.is_err(), "refresh should still be running");

        // The spawned refresh finishes on its own
        for _ in 0..50 {
            if tokens.is_valid().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(tokens.is_valid().await);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }
}
