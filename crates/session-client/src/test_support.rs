//! In-process mock of the remote API for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde_json::{Value, json};
use session_auth::{MemoryStorage, SubscriberRegistry, TokenStore};
use tokio::net::TcpListener;

#[derive(Default)]
struct MockState {
    accepted: String,
    rotation: Option<String>,
    reject_refresh: bool,
    refresh_delay_ms: u64,
    refresh_bodies: Vec<Value>,
    logout_bodies: Vec<Value>,
    last_authorization: Option<String>,
}

/// Mock API bound to an ephemeral localhost port.
///
/// `/items` accepts exactly one bearer token (`accept()`); every successful
/// refresh mints `A-fresh-{n}` and makes it the accepted token.
#[derive(Clone)]
pub struct MockApi {
    pub base_url: String,
    pub refresh_calls: Arc<AtomicUsize>,
    pub protected_calls: Arc<AtomicUsize>,
    pub always_401_calls: Arc<AtomicUsize>,
    pub broken_calls: Arc<AtomicUsize>,
    pub logout_calls: Arc<AtomicUsize>,
    state: Arc<Mutex<MockState>>,
}

impl MockApi {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let api = Self {
            base_url: format!("http://{addr}/api/v1"),
            refresh_calls: Arc::default(),
            protected_calls: Arc::default(),
            always_401_calls: Arc::default(),
            broken_calls: Arc::default(),
            logout_calls: Arc::default(),
            state: Arc::default(),
        };

        let app = axum::Router::new()
            .route("/api/v1/auth/refresh", post(refresh))
            .route("/api/v1/auth/login", post(login))
            .route("/api/v1/auth/logout", post(logout))
            .route("/api/v1/items", get(items))
            .route("/api/v1/items/{id}", delete(delete_item))
            .route("/api/v1/always-401", get(always_401))
            .route("/api/v1/broken", get(broken))
            .route("/api/v1/invalid", get(invalid))
            .route("/api/v1/garbage", get(garbage))
            .route("/api/v1/echo", post(echo).put(echo))
            .with_state(api.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        api
    }

    pub fn accept(&self, token: &str) {
        self.state.lock().unwrap().accepted = token.to_owned();
    }

    pub fn set_rotation(&self, refresh: &str) {
        self.state.lock().unwrap().rotation = Some(refresh.to_owned());
    }

    pub fn reject_refresh(&self) {
        self.state.lock().unwrap().reject_refresh = true;
    }

    pub fn set_refresh_delay_ms(&self, ms: u64) {
        self.state.lock().unwrap().refresh_delay_ms = ms;
    }

    pub fn refresh_bodies(&self) -> Vec<Value> {
        self.state.lock().unwrap().refresh_bodies.clone()
    }

    pub fn logout_bodies(&self) -> Vec<Value> {
        self.state.lock().unwrap().logout_bodies.clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.lock().unwrap().last_authorization.clone()
    }
}

/// Token store over `storage` that records every auth-state notification.
pub fn recording_store(
    storage: MemoryStorage,
) -> (Arc<TokenStore>, Arc<MemoryStorage>, Arc<Mutex<Vec<bool>>>) {
    let storage = Arc::new(storage);
    let registry = SubscriberRegistry::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    registry
        .on_change(move |state| sink.lock().unwrap().push(state))
        .detach();
    let tokens = Arc::new(TokenStore::new(storage.clone(), registry));
    (tokens, storage, events)
}

fn envelope(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message,
            "status_code": status.as_u16(),
        })),
    )
        .into_response()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn refresh(State(api): State<MockApi>, Json(body): Json<Value>) -> Response {
    let n = api.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = {
        let mut state = api.state.lock().unwrap();
        state.refresh_bodies.push(body);
        state.refresh_delay_ms
    };
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let mut state = api.state.lock().unwrap();
    if state.reject_refresh {
        return envelope(StatusCode::UNAUTHORIZED, "refresh_invalid", "refresh token revoked");
    }
    let access = format!("A-fresh-{n}");
    state.accepted = access.clone();
    let mut response = json!({"access_token": access, "expires_in": 3600});
    if let Some(rotated) = &state.rotation {
        response["refresh_token"] = json!(rotated);
    }
    Json(response).into_response()
}

async fn login(State(api): State<MockApi>, Json(body): Json<Value>) -> Response {
    if body["password"] != "hunter2" {
        return envelope(StatusCode::UNAUTHORIZED, "invalid_credentials", "bad username or password");
    }
    api.state.lock().unwrap().accepted = "A-login".into();
    Json(json!({
        "access_token": "A-login",
        "refresh_token": "R-login",
        "expires_in": 3600
    }))
    .into_response()
}

async fn logout(State(api): State<MockApi>, Json(body): Json<Value>) -> Response {
    api.logout_calls.fetch_add(1, Ordering::SeqCst);
    api.state.lock().unwrap().logout_bodies.push(body);
    StatusCode::NO_CONTENT.into_response()
}

async fn items(State(api): State<MockApi>, headers: HeaderMap, uri: Uri) -> Response {
    api.protected_calls.fetch_add(1, Ordering::SeqCst);
    let authorization = header(&headers, "authorization");
    let mut state = api.state.lock().unwrap();
    state.last_authorization = authorization.clone();
    if authorization.as_deref() != Some(format!("Bearer {}", state.accepted).as_str()) {
        return envelope(StatusCode::UNAUTHORIZED, "token_invalid", "token expired");
    }
    Json(json!({
        "authorization": authorization,
        "query": uri.query(),
        "items": [1, 2, 3],
    }))
    .into_response()
}

async fn delete_item() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn garbage() -> Response {
    (StatusCode::OK, "not json").into_response()
}

async fn always_401(State(api): State<MockApi>) -> Response {
    api.always_401_calls.fetch_add(1, Ordering::SeqCst);
    envelope(StatusCode::UNAUTHORIZED, "token_invalid", "token expired")
}

async fn broken(State(api): State<MockApi>) -> Response {
    api.broken_calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
}

async fn invalid() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "error": "validation_failed",
            "message": "name is required",
            "status_code": 422,
            "request_id": "req_mock",
            "details": {"name": "required"},
        })),
    )
        .into_response()
}

async fn echo(headers: HeaderMap, body: Bytes) -> Response {
    Json(json!({
        "content_type": header(&headers, "content-type"),
        "authorization": header(&headers, "authorization"),
        "request_id": header(&headers, "x-request-id"),
        "body": String::from_utf8_lossy(&body),
        "body_len": body.len(),
    }))
    .into_response()
}
