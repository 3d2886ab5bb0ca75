#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{self, get},
    Json, Router,
};
use idempotency_guard::api::idempotent;
use idempotency_guard::idempotency::{
    IdempotencyConfig, IdempotencyGuard, InMemoryLock, InMemoryResponseCache, RequesterIdentity,
};
use tower::ServiceExt;

pub const KEY_HEADER: &str = "Idempotency-Key";
pub const REPLAYED: &str = "Idempotent-Replayed";

/// Router plus handles on everything a test wants to inspect.
pub struct TestApp {
    pub router: Router,
    pub calls: Arc<AtomicUsize>,
    pub guard: IdempotencyGuard,
    pub cache: Arc<InMemoryResponseCache>,
    pub lock: Arc<InMemoryLock>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(IdempotencyConfig::default())
    }

    pub fn with_config(config: IdempotencyConfig) -> Self {
        let cache = Arc::new(InMemoryResponseCache::new());
        let lock = Arc::new(InMemoryLock::new());
        let guard = IdempotencyGuard::new(config, cache.clone(), lock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let routes = Router::new()
            .route("/test-endpoint", routing::post(create).patch(create))
            .route("/test-get", get(read))
            .route("/slow", routing::post(slow_create))
            .route("/fail", routing::post(fail));

        let router = idempotent(routes, guard.clone())
            .layer(middleware::from_fn(identity_from_header))
            .with_state(calls.clone());

        Self {
            router,
            calls,
            guard,
            cache,
            lock,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn send(&self, request: Request) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }
}

/// Handler counts every execution and returns the count as its id.
async fn create(State(calls): State<Arc<AtomicUsize>>, body: String) -> Response {
    let id = calls.fetch_add(1, Ordering::SeqCst) + 1;
    let mut response = (
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "created": true, "echo": body })),
    )
        .into_response();
    response
        .headers_mut()
        .insert("set-cookie", HeaderValue::from_static("session=abc123"));
    response
        .headers_mut()
        .insert("x-order-source", HeaderValue::from_static("test-suite"));
    if let Ok(disposition) = HeaderValue::from_bytes("attachment; filename=\"reçu.pdf\"".as_bytes()) {
        response.headers_mut().insert("content-disposition", disposition);
    }
    response
}

async fn read(State(calls): State<Arc<AtomicUsize>>) -> Json<serde_json::Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "ok": true }))
}

async fn slow_create(State(calls): State<Arc<AtomicUsize>>) -> Response {
    let id = calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(Duration::from_millis(100)).await;
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
}

async fn fail(State(calls): State<Arc<AtomicUsize>>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "downstream exploded").into_response()
}

/// Stands in for authentication: `x-user` becomes the requester identity.
async fn identity_from_header(mut request: Request, next: Next) -> Response {
    let user = request
        .headers()
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(user) = user {
        request.extensions_mut().insert(RequesterIdentity(user));
    }
    next.run(request).await
}

pub fn request(method: &str, uri: &str, key: Option<&str>, body: &str) -> Request {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(KEY_HEADER, key);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

pub fn post(key: Option<&str>, body: &str) -> Request {
    request("POST", "/test-endpoint", key, body)
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("readable body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn replayed(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(REPLAYED)
        .and_then(|v| v.to_str().ok())
}

pub fn unique_key() -> String {
    uuid::Uuid::new_v4().to_string()
}
