//! HTTP surface: session history, manual triggers, health observations,
//! and the per-session live stream.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::SinkExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::error;

use chrono::{DateTime, Utc};

use crate::gate::{self, SafetyGate};
use crate::health::{HealthRepo, HealthStatus};
use crate::hub::{SessionHub, StreamItem};
use crate::scheduler::TriggerRequest;
use crate::sessions::SessionRepo;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: SessionRepo,
    pub health: HealthRepo,
    pub gate: SafetyGate,
    pub hub: Arc<SessionHub>,
    pub trigger_tx: mpsc::Sender<TriggerRequest>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/trigger", post(trigger_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/stream", get(stream_session))
        .route("/observations", post(record_observation))
        .route("/actions/check", post(check_action))
        .route("/actions", post(record_action))
        .with_state(state)
}

/// GET /sessions — recent session history, newest first.
async fn list_sessions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.sessions.list_recent(100).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            error!("list sessions: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /sessions/:id
async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.sessions.get(id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such session").into_response(),
        Err(e) => {
            error!("get session {id}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(serde::Deserialize)]
pub struct TriggerBody {
    #[serde(default = "default_tier")]
    pub tier: i64,
    pub parent_id: Option<i64>,
}

fn default_tier() -> i64 {
    1
}

/// POST /sessions/trigger — offer a manual session request at the
/// scheduler's next decision point. No queueing beyond the channel.
async fn trigger_session(
    State(state): State<ApiState>,
    Json(body): Json<TriggerBody>,
) -> impl IntoResponse {
    if body.tier < 1 {
        return (StatusCode::BAD_REQUEST, "tier must be >= 1").into_response();
    }
    let req = TriggerRequest {
        tier: body.tier,
        parent_id: body.parent_id,
    };
    match state.trigger_tx.try_send(req) {
        Ok(()) => Json(json!({ "status": "queued", "tier": body.tier })).into_response(),
        Err(e) => {
            error!("trigger session: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "scheduler unavailable").into_response()
        }
    }
}

#[derive(serde::Deserialize)]
pub struct ObservationBody {
    pub session_id: i64,
    pub service: String,
    pub status: HealthStatus,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
}

/// POST /observations — record one health observation and feed the
/// safety gate's streak bookkeeping.
async fn record_observation(
    State(state): State<ApiState>,
    Json(body): Json<ObservationBody>,
) -> impl IntoResponse {
    let inserted = state
        .health
        .insert(
            body.session_id,
            &body.service,
            body.status,
            body.latency_ms,
            body.error.as_deref(),
        )
        .await;
    if let Err(e) = inserted {
        error!("record observation: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    if let Err(e) = state
        .gate
        .record_observation(&body.service, body.status.is_healthy())
        .await
    {
        error!("update streak for {}: {e}", body.service);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    Json(json!({ "status": "recorded", "service": body.service })).into_response()
}

#[derive(serde::Deserialize)]
pub struct ActionCheckBody {
    pub resource: String,
    pub kind: String,
}

/// POST /actions/check — consult the safety gate before a mutating
/// action. A blocked decision means the caller skips the action and
/// surfaces it for attention instead.
async fn check_action(
    State(state): State<ApiState>,
    Json(body): Json<ActionCheckBody>,
) -> impl IntoResponse {
    let Some((window, limit)) = gate::policy_for(&body.kind) else {
        return (StatusCode::BAD_REQUEST, "unknown action kind").into_response();
    };
    match state
        .gate
        .check_and_count(&body.resource, &body.kind, window, limit)
        .await
    {
        Ok(decision) => Json(json!({
            "allowed": decision.allowed,
            "count": decision.count,
            "limit": limit,
        }))
        .into_response(),
        Err(e) => {
            error!("check action for {}: {e}", body.resource);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(serde::Deserialize)]
pub struct ActionBody {
    pub resource: String,
    pub kind: String,
    /// When the action actually ran; defaults to now.
    pub executed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
    pub session_id: Option<i64>,
}

/// POST /actions — record one attempted action against the gate's
/// window, successful or not.
async fn record_action(
    State(state): State<ApiState>,
    Json(body): Json<ActionBody>,
) -> impl IntoResponse {
    if gate::policy_for(&body.kind).is_none() {
        return (StatusCode::BAD_REQUEST, "unknown action kind").into_response();
    }
    let executed_at = body.executed_at.unwrap_or_else(Utc::now);
    match state
        .gate
        .record(
            &body.resource,
            &body.kind,
            executed_at,
            body.success,
            body.error.as_deref(),
            body.session_id,
        )
        .await
    {
        Ok(()) => Json(json!({ "status": "recorded", "resource": body.resource })).into_response(),
        Err(e) => {
            error!("record action for {}: {e}", body.resource);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /sessions/:id/stream — websocket delivering buffered catch-up
/// lines, then live formatted lines, terminated by an eof frame.
async fn stream_session(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_stream_socket(socket, hub, id))
}

async fn handle_stream_socket(mut socket: WebSocket, hub: Arc<SessionHub>, session_id: i64) {
    let sub = hub.subscribe(session_id);

    for line in &sub.replay {
        let frame = json!({ "type": "line", "text": line }).to_string();
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    let Some(mut rx) = sub.live else {
        let _ = socket
            .send(Message::Text(json!({ "type": "eof" }).to_string().into()))
            .await;
        let _ = socket.close().await;
        return;
    };

    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Ok(StreamItem::Line(line)) => {
                        let frame = json!({ "type": "line", "text": line }).to_string();
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(StreamItem::Eof) => {
                        let _ = socket
                            .send(Message::Text(json!({ "type": "eof" }).to_string().into()))
                            .await;
                        let _ = socket.close().await;
                        return;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        let frame = json!({ "type": "lagged", "skipped": skipped }).to_string();
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = socket
                            .send(Message::Text(json!({ "type": "eof" }).to_string().into()))
                            .await;
                        let _ = socket.close().await;
                        return;
                    }
                }
            }
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session_id, error = %e, "stream websocket receive error");
                        return;
                    }
                }
            }
        }
    }
}
