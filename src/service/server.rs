//! Minimal transport surface (spec §6.2): a WebSocket handler for
//! Dragon's interactive message contract and a JSON `POST /delegate`
//! endpoint for Wyvern to hand a task straight to the Tracker. Neither
//! is hardened for production transport — no TLS, no backpressure, no
//! reconnect storm handling — that's explicitly out of scope; the
//! message contract is what's under test here.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use forge_common::{AgentType, Priority, Task};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::OrchestratorService;

pub fn router(service: OrchestratorService) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/delegate", post(delegate_handler))
        .with_state(Arc::new(service))
}

/// Client → server frames over the Dragon WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    UserTurn { session_id: Option<Uuid>, project_id: Option<Uuid>, text: String },
    SessionReplay { session_id: Uuid },
    ClearContext { session_id: Uuid },
    Reload,
}

/// Server → client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Pong,
    DragonMessage { session_id: Uuid, council_member: String, text: String },
    SessionResumed { session_id: Uuid },
    SessionNotFound { session_id: Uuid },
    SessionReplayComplete { session_id: Uuid, history: Vec<HistoryEntry> },
    Error { message: String },
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    role: String,
    council_member: Option<String>,
    content: String,
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<Arc<OrchestratorService>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

#[instrument(skip(socket, service))]
async fn handle_socket(mut socket: WebSocket, service: Arc<OrchestratorService>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else { continue };
        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => handle_client_message(&service, client_msg).await,
            Err(err) => ServerMessage::Error { message: format!("malformed message: {err}") },
        };
        let Ok(payload) = serde_json::to_string(&reply) else { break };
        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
            break;
        }
    }
}

async fn handle_client_message(service: &OrchestratorService, msg: ClientMessage) -> ServerMessage {
    match msg {
        ClientMessage::Ping | ClientMessage::Reload => ServerMessage::Pong,
        ClientMessage::UserTurn { session_id, project_id, text } => {
            match service.dragon.handle_turn(session_id, project_id, &text).await {
                Ok(outcome) if !outcome.session_known && session_id.is_some() => {
                    ServerMessage::SessionNotFound { session_id: outcome.session_id }
                }
                Ok(outcome) => ServerMessage::DragonMessage {
                    session_id: outcome.session_id,
                    council_member: outcome.council_member.to_string(),
                    text: outcome.reply,
                },
                Err(err) => {
                    warn!(error = %err, "dragon turn failed");
                    ServerMessage::Error { message: err.to_string() }
                }
            }
        }
        ClientMessage::SessionReplay { session_id } => match service.sessions.get(session_id).await {
            Ok(session) => ServerMessage::SessionReplayComplete {
                session_id,
                history: session
                    .history
                    .iter()
                    .map(|m| HistoryEntry {
                        role: format!("{:?}", m.role).to_lowercase(),
                        council_member: m.council_member.clone(),
                        content: m.content.clone(),
                    })
                    .collect(),
            },
            Err(_) => ServerMessage::SessionNotFound { session_id },
        },
        ClientMessage::ClearContext { session_id } => match service.sessions.clear(session_id).await {
            Ok(_) => ServerMessage::SessionResumed { session_id },
            Err(_) => ServerMessage::SessionNotFound { session_id },
        },
    }
}

/// `POST /delegate` request body — Wyvern asking the Tracker to take on
/// one more task against an already-registered project.
#[derive(Debug, Deserialize)]
struct DelegateRequest {
    project_id: Uuid,
    description: String,
    area: String,
    agent_type: AgentType,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    depends_on: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct DelegateResponse {
    task_id: Uuid,
}

#[derive(Debug, Serialize)]
struct DelegateError {
    message: String,
}

async fn delegate_handler(
    State(service): State<Arc<OrchestratorService>>,
    Json(request): Json<DelegateRequest>,
) -> impl IntoResponse {
    let project = match service.registry.get(request.project_id).await {
        Ok(project) => project,
        Err(err) => {
            return (StatusCode::NOT_FOUND, Json(DelegateError { message: err.to_string() })).into_response();
        }
    };

    let mut task = Task::new(project.id, request.description, request.area, request.agent_type, project.specification_version);
    task.dependencies = request.depends_on;
    if let Some(priority) = request.priority {
        task = task.with_priority(priority);
    }
    let task_id = task.id;

    if let Err(err) = service.tracker.add(task).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(DelegateError { message: err.to_string() })).into_response();
    }
    (StatusCode::CREATED, Json(DelegateResponse { task_id })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning_context::provider::NullProvider;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn service() -> (OrchestratorService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(NullProvider);
        let service = OrchestratorService::load(dir.path(), provider).await.unwrap();
        (service, dir)
    }

    use crate::planning_context::provider::Provider;

    #[tokio::test]
    async fn delegate_registers_a_task_against_an_existing_project() {
        let (service, dir) = service().await;
        let project = service.registry.create("demo", dir.path().to_path_buf(), "spec").await.unwrap();
        service.tracker.register_project(project.id, dir.path()).await.unwrap();

        let app = router(service.clone());
        let body = serde_json::json!({
            "project_id": project.id,
            "description": "wire the thing up",
            "area": "backend",
            "agent_type": "coding",
        });
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/delegate")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: DelegateResponse = serde_json::from_slice(&bytes).unwrap();
        let tasks = service.tracker.list_all(project.id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, parsed.task_id);
    }

    #[tokio::test]
    async fn delegate_against_an_unknown_project_returns_not_found() {
        let (service, _dir) = service().await;
        let app = router(service);
        let body = serde_json::json!({
            "project_id": Uuid::new_v4(),
            "description": "x",
            "area": "backend",
            "agent_type": "coding",
        });
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/delegate")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
