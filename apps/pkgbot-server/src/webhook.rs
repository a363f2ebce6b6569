//! Inbound half of the HTTP chat bridge plus health and stats endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pkgbot_core::transport::{InboundMessage, SessionState, SessionTracker};
use pkgbot_core::{Disposition, Dispatcher, StatsSnapshot, StatsSources};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub(crate) struct WebhookState {
    pub dispatcher: Dispatcher,
    pub session: Arc<SessionTracker>,
    pub stats: StatsSources,
}

pub(crate) fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/inbound", post(inbound))
        .route("/session", post(session_update))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InboundPayload {
    id: String,
    from: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    from_me: bool,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    state: SessionState,
}

async fn inbound(
    State(state): State<WebhookState>,
    Json(payload): Json<InboundPayload>,
) -> (StatusCode, Json<Value>) {
    let message = InboundMessage {
        message_id: payload.id,
        sender: payload.from,
        text: payload.text,
        from_me: payload.from_me,
    };
    // The ticket is dropped: the request keeps running on its executor.
    match state.dispatcher.dispatch(message).await {
        Disposition::Queued { request_id, .. } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "request_id": request_id })),
        ),
        other => (StatusCode::OK, Json(json!({ "status": other.as_str() }))),
    }
}

async fn session_update(
    State(state): State<WebhookState>,
    Json(payload): Json<SessionPayload>,
) -> Json<Value> {
    let current = state.session.update(payload.state);
    Json(json!({ "state": current.as_str() }))
}

async fn healthz(State(state): State<WebhookState>) -> Json<Value> {
    let snapshot = state.stats.snapshot();
    Json(json!({
        "ok": true,
        "session": snapshot.session.as_str(),
        "fetch_service": snapshot.fetch_service.as_str(),
    }))
}

async fn stats(State(state): State<WebhookState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
