use axum::{
    Router,
    routing::{get, post},
};

pub mod common;
pub mod security;
pub mod system;

/// All endpoints. `/health` is public and skipped by the security gate.
pub fn router() -> Router {
    Router::new().route("/health", get(system::health)).nest(
        "/security",
        Router::new()
            .route("/context", get(security::context))
            .route("/context/validate", get(security::validate_context))
            .route("/policies", get(security::policies))
            .route("/compliance", get(security::compliance))
            .route("/bypass", post(security::bypass)),
    )
}
