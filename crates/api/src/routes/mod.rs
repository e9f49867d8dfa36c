//! HTTP routes

pub mod cases;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        .route("/webhooks/email", post(webhooks::email_delivery_event))
        .route("/cases/{id}/retry", post(cases::manual_retry))
        .route("/internal/invariants", get(cases::run_invariants))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
