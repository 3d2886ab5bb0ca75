use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::middleware::idempotent;
use crate::idempotency::IdempotencyGuard;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: IdempotencyGuard,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(guard: IdempotencyGuard) -> Self {
        Self {
            guard,
            metrics_handle: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let guarded = idempotent(
        Router::new()
            .route("/requests", post(handlers::create_request))
            .route(
                "/requests/:id",
                get(handlers::get_request).patch(handlers::update_request),
            ),
        state.guard.clone(),
    );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(guarded)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
