//! HTTP endpoints for health and diagnostics.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use crate::diagnostics::DiagnosticsScope;
use crate::worker::Dispatcher;

/// Shared state for the diagnostics routes.
#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Dispatcher,
}

/// Build the router with `/health` and `/api/diagnostics`.
pub fn diagnostics_routes(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/diagnostics", get(diagnostics))
        .with_state(HttpState { dispatcher })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-relay"
    }))
}

// ── Diagnostics ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    scope: Option<String>,
    conversation_id: Option<String>,
}

async fn diagnostics(
    State(state): State<HttpState>,
    Query(query): Query<DiagnosticsQuery>,
) -> impl IntoResponse {
    let scope = match DiagnosticsScope::parse(query.scope.as_deref(), query.conversation_id.as_deref()) {
        Ok(scope) => scope,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            );
        }
    };

    let snapshot = state.dispatcher.diagnostics(&scope).await;
    (StatusCode::OK, Json(serde_json::json!(snapshot)))
}
