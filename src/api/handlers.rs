use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::api::responses::{ApiResponse, ErrorResponse, HealthResponse, RequestRecordResponse};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        idempotency: state.guard.metrics().snapshot(),
    };

    Json(ApiResponse::success(response))
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(ErrorResponse::new(
                "METRICS_DISABLED",
                "Metrics recorder is not installed",
            ))),
        )
            .into_response(),
    }
}

/// Creates a record. Every call yields a fresh id, so replays are observable.
pub async fn create_request(
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<RequestRecordResponse>) {
    let response = RequestRecordResponse {
        id: Uuid::new_v4(),
        created: true,
        payload,
    };
    tracing::info!(id = %response.id, "Created request record");

    (StatusCode::CREATED, Json(response))
}

/// Updates a record in place.
pub async fn update_request(
    Path(id): Path<Uuid>,
    Json(payload): Json<serde_json::Value>,
) -> Json<RequestRecordResponse> {
    tracing::info!(id = %id, "Updated request record");

    Json(RequestRecordResponse {
        id,
        created: false,
        payload,
    })
}

/// Reads a record. GET is never guarded.
pub async fn get_request(Path(id): Path<Uuid>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "id": id, "ok": true }))
}
