use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    Router,
};

use crate::idempotency::IdempotencyGuard;

/// Axum middleware running each request through the idempotency guard.
pub async fn idempotency_middleware(
    State(guard): State<IdempotencyGuard>,
    request: Request,
    next: Next,
) -> Response {
    guard.handle(request, |req| next.run(req)).await
}

/// Puts every route currently registered on `router` behind the guard.
pub fn idempotent<S>(router: Router<S>, guard: IdempotencyGuard) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(guard, idempotency_middleware))
}
