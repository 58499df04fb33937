//! HTTP and WebSocket surface.
//!
//! One POST endpoint carries every player command; a per-user WebSocket at
//! `/ws/{user_no}` delivers completion pushes and answers ping/heartbeat
//! frames; `/health` reports subsystem status.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::cors::CorsLayer;

use wk_core::types::UserNo;
use wk_game::Deps;

use crate::dispatcher::dispatch;
use crate::health::HealthRegistry;
use crate::protocol::{ApiRequest, ClientMessage};
use crate::push::PushChannel;

/// Shared state for all HTTP/WS handlers.
pub struct AppState {
    pub deps: Arc<Deps>,
    pub push: Arc<PushChannel>,
    pub health: Arc<HealthRegistry>,
}

impl AppState {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self {
            deps,
            push: Arc::new(PushChannel::new()),
            health: Arc::new(HealthRegistry::new()),
        }
    }
}

/// Build the full router: command endpoint, push socket, health.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", post(handle_api))
        .route("/ws/{user_no}", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Command endpoint
// ---------------------------------------------------------------------------

/// `POST /api` — `{user_no, api_code, data}` in, `{success, message, data}`
/// out. The HTTP status mirrors `success`.
async fn handle_api(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiRequest>,
) -> impl IntoResponse {
    let (status, resp) = dispatch(&state.deps, &req).await;
    (status, Json(resp))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let persistence_ok = state.deps.db.ping().await;
    let body = json!({
        "status": if persistence_ok { "ok" } else { "degraded" },
        "cache": "ok",
        "persistence": if persistence_ok { "ok" } else { "error" },
        "task_worker": state.health.task_worker_status(),
        "sync_workers": state.health.sync_worker_statuses(),
        "push_sessions": state.push.session_count(),
    });
    let status = if persistence_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `GET /ws/{user_no}` — upgrade to the push channel for one user.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_no): Path<UserNo>,
) -> impl IntoResponse {
    if user_no <= 0 {
        return (StatusCode::BAD_REQUEST, "invalid user number").into_response();
    }
    ws.on_upgrade(move |socket| handle_ws(socket, state, user_no))
        .into_response()
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, user_no: UserNo) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let push_rx = state.push.connect(user_no);
    tracing::info!(user_no, "push session connected");

    // Forward task: queued push messages -> socket. Ends when the session
    // is replaced by a reconnect (sender dropped) or the socket dies.
    let forward = async {
        while let Ok(text) = push_rx.recv_async().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    // Read loop: answer ping/heartbeat frames through the push channel.
    let push = state.push.clone();
    let read = async {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping { timestamp }) => {
                        push.send(user_no, &json!({ "type": "pong", "timestamp": timestamp }));
                    }
                    Ok(ClientMessage::Heartbeat) => {
                        push.send(user_no, &json!({ "type": "heartbeat_ack" }));
                    }
                    Err(_) => {
                        push.send(
                            user_no,
                            &json!({ "type": "error", "message": "invalid message" }),
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = forward => {
            // Session replaced or socket failed; the registry entry (if
            // any) belongs to a newer connection now.
        }
        _ = read => {
            // Client went away. Drop the session unless a reconnect
            // already replaced it.
            state.push.disconnect(user_no);
        }
    }
    tracing::info!(user_no, "push session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wk_core::catalog::GameCatalog;
    use wk_core::config::ServerConfig;

    async fn test_state() -> Arc<AppState> {
        let deps = Deps::in_memory(GameCatalog::default(), ServerConfig::default())
            .await
            .unwrap();
        Arc::new(AppState::new(deps))
    }

    fn api_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri("/api")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn login_roundtrip_over_http() {
        let state = test_state().await;
        let app = api_router(state);

        let resp = app
            .oneshot(api_request(
                json!({ "user_no": 1001, "api_code": 1010, "data": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["data"]["resources"]["food"], 5000);
    }

    #[tokio::test]
    async fn unknown_code_maps_to_400() {
        let state = test_state().await;
        let app = api_router(state);
        let resp = app
            .oneshot(api_request(json!({ "user_no": 1, "api_code": 42 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_subsystems() {
        let state = test_state().await;
        state
            .health
            .register_task_worker(std::time::Duration::from_secs(1));
        let app = api_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["persistence"], "ok");
        assert_eq!(parsed["task_worker"], "ok");
    }
}
