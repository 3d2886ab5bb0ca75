pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;

pub use middleware::{idempotency_middleware, idempotent};
pub use routes::{create_router, AppState};
