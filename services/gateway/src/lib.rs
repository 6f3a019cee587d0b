pub mod auth;
pub mod config;
pub mod http;
pub mod rooms;
pub mod sse;
pub mod state;
pub mod ws;

pub use config::Config;
pub use state::AppState;

use axum::routing::{delete, get, post};
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/ws/v1/gateway", get(ws::ws_handler))
        .route("/api/v1/stream", get(sse::stream_handler))
        .route(
            "/api/v1/subscriptions",
            get(http::subscriptions::list_subscriptions).post(http::subscriptions::create_subscription),
        )
        .route(
            "/api/v1/subscriptions/:subscription_id",
            delete(http::subscriptions::delete_subscription),
        )
        .route("/api/v1/events/replay", post(http::replay::start_replay))
        .route(
            "/api/v1/events/replay/:replay_id",
            get(http::replay::replay_status).delete(http::replay::stop_replay),
        )
        .route("/api/v1/events/:event_id/deliver", post(http::endpoints::deliver_event))
        .route(
            "/api/v1/endpoints",
            get(http::endpoints::list_endpoints).post(http::endpoints::create_endpoint),
        )
        .route(
            "/api/v1/endpoints/:endpoint_id",
            get(http::endpoints::get_endpoint)
                .patch(http::endpoints::update_endpoint)
                .delete(http::endpoints::delete_endpoint),
        )
        .route(
            "/api/v1/receipts/:receipt_id/ack",
            post(http::endpoints::acknowledge_receipt),
        )
        .route("/api/v1/sessions/:session_id", get(http::monitoring::get_session))
        .route("/api/v1/audit", get(http::monitoring::audit_timeline))
        .route(
            "/api/v1/dlq/:entry_id/ack",
            post(http::monitoring::acknowledge_dlq_entry),
        )
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> axum::response::Response {
    http::response::core_error_response(apix_core::CoreError::NotFound("no such route".into()))
}

/// Runs until the process exits, marking sessions `Reconnecting` once
/// they've missed 3 consecutive heartbeats (§4.2).
pub async fn run_heartbeat_sweep(state: AppState) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    loop {
        ticker.tick().await;
        let stale = state.connections.sweep_stale_sessions(state.config.heartbeat_interval);
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "marked sessions reconnecting after missed heartbeats");
        }
    }
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
