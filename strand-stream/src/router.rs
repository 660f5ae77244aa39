use axum::Router;
use axum::routing::{get, post};

use crate::handlers;
use crate::state::StreamState;

/// Build the streaming axum Router with all endpoints.
pub fn stream_router(state: StreamState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/healthz", get(handlers::health_handler))
        .route("/api/v1/events", get(handlers::events_handler))
        .route("/api/v1/tasks", post(handlers::submit_task_handler))
        .route(
            "/api/v1/tool-calls/{id}/confirm",
            post(handlers::confirm_tool_call_handler),
        )
        .route(
            "/api/v1/sessions/{id}/compress",
            post(handlers::compress_session_handler),
        )
        .route(
            "/api/v1/sessions/{id}/cancel",
            post(handlers::cancel_session_handler),
        )
        .with_state(state)
}
