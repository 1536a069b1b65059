//! Host-owned session context
//!
//! One `Session` per API session. Clones are cheap and share credentials,
//! the refresh slot and subscribers, so the host can hand a clone to every
//! component that talks to the API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use session_auth::{
    KeyValueStorage, LOGOUT_PATH, MemoryStorage, SubscriberRegistry, Subscription, TokenStore,
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::RequestExecutor;
use crate::refresh::RefreshCoordinator;
use crate::request::{ApiResponse, Query, RequestBody, RequestOptions};

/// Transport timeout applied when the builder creates the HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<TokenStore>,
    refresh: Arc<RefreshCoordinator>,
    executor: RequestExecutor,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct SessionBuilder {
    base_url: Option<String>,
    http: Option<reqwest::Client>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    timeout: Option<Duration>,
}

impl SessionBuilder {
    /// API root, e.g. `https://media.example.com/api/v1`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Use a preconfigured client. `timeout()` is ignored in that case.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Where the refresh token is persisted. Defaults to `MemoryStorage`.
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Session> {
        let raw = self
            .base_url
            .ok_or_else(|| Error::Config("base_url is required".into()))?;
        let parsed =
            Url::parse(&raw).map_err(|e| Error::Config(format!("invalid base_url {raw}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "base_url must be http or https, got {}",
                parsed.scheme()
            )));
        }
        let base_url = raw.trim_end_matches('/').to_owned();

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
                .build()
                .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?,
        };
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let tokens = Arc::new(TokenStore::new(storage, SubscriberRegistry::new()));
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&tokens),
            http.clone(),
            base_url.clone(),
        ));
        let executor = RequestExecutor::new(
            http.clone(),
            base_url.clone(),
            Arc::clone(&tokens),
            Arc::clone(&refresh),
        );

        debug!(base_url = %base_url, "session created");
        Ok(Session {
            inner: Arc::new(Inner {
                base_url,
                http,
                tokens,
                refresh,
                executor,
            }),
        })
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Credential store, for flows that obtain tokens themselves.
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    /// Observe login/logout transitions. Keep the handle alive.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.tokens.on_change(callback)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.tokens.is_valid().await
    }

    /// Refresh now if the access token has lapsed. `false` when no valid
    /// token could be obtained.
    pub async fn ensure_valid(&self) -> bool {
        self.inner.refresh.ensure().await
    }

    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<&RequestBody>,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        self.inner
            .executor
            .execute(method, path, query, body, options)
            .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &Query) -> Result<T> {
        self.execute(Method::GET, path, query, None, &RequestOptions::new())
            .await?
            .into_json()
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PATCH, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(Method::DELETE, path, &Query::new(), None, &RequestOptions::new())
            .await?
            .into_json()
    }

    async fn send_json<T, B>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = RequestBody::json(body)?;
        self.execute(method, path, &Query::new(), Some(&body), &RequestOptions::new())
            .await?
            .into_json()
    }

    /// Exchange username and password for a token pair and store it.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let response =
            session_auth::login(&self.inner.http, &self.inner.base_url, username, password)
                .await?;
        let Some(refresh) = response.refresh_token else {
            return Err(Error::Transport(
                "login response carried no refresh token".into(),
            ));
        };
        self.inner
            .tokens
            .set(response.access_token, refresh, response.expires_in)
            .await;
        info!(username, expires_in = response.expires_in, "logged in");
        Ok(())
    }

    /// Revoke the refresh token server-side and clear local credentials.
    ///
    /// Local credentials are cleared even when the call fails; the failure is
    /// still returned. A session the server already considers dead (the
    /// call ends in `AuthExpired`) counts as logged out.
    pub async fn logout(&self) -> Result<()> {
        let tokens = &self.inner.tokens;
        let Some(refresh) = tokens.get_refresh().await else {
            if tokens.get().await.is_some() {
                tokens.clear().await;
            }
            debug!("no refresh token held, nothing to revoke");
            return Ok(());
        };

        let body = RequestBody::json(&serde_json::json!({
            "refresh_token": refresh.expose_str(),
        }))?;
        let result = self
            .execute(
                Method::POST,
                LOGOUT_PATH,
                &Query::new(),
                Some(&body),
                &RequestOptions::new(),
            )
            .await;

        if tokens.get().await.is_some() || tokens.get_refresh().await.is_some() {
            tokens.clear().await;
        }

        match result {
            Ok(_) | Err(Error::AuthExpired(_)) => {
                info!("logged out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
