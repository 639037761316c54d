use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use waypoint_core::chat::Role;
use waypoint_core::events::ChatEvent;
use waypoint_core::ids::{ConversationId, DeploymentId, TaskId, UserId};
use waypoint_engine::runner::TurnRequest;
use waypoint_engine::status::{task_snapshot, PollWatcher};
use waypoint_store::conversations::ConversationRepo;
use waypoint_store::deployments::DeploymentRepo;
use waypoint_store::projects::ProjectRepo;
use waypoint_store::tasks::TaskRepo;
use waypoint_store::StoreError;

use crate::server::AppState;

/// Caller identity, resolved upstream and trusted from headers.
pub struct Identity {
    pub user_id: UserId,
    pub email: String,
}

/// Read `x-user-id` / `x-user-email`. The auth layer in front of this
/// service guarantees them; a request without both never passed auth.
fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, Response> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let email = headers
        .get("x-user-email")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    match (user_id, email) {
        (Some(user_id), Some(email)) => Ok(Identity {
            user_id: UserId::from_raw(user_id),
            email: email.to_string(),
        }),
        _ => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing x-user-id / x-user-email headers",
        )),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(message) => error_response(StatusCode::NOT_FOUND, &message),
        StoreError::Conflict(message) => error_response(StatusCode::CONFLICT, &message),
        other => {
            warn!(error = %other, "store error serving request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub content: String,
    pub project_name: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Role the message is recorded under; defaults to `user`.
    #[serde(default)]
    pub role: Option<Role>,
}

/// POST /api/chat: run one conversational turn, streaming ChatEvent
/// frames as SSE until `turn_complete` or `error`. Dropping the connection
/// drops the turn guard, which cancels the turn.
pub async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if body.content.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content must not be empty");
    }
    if body.project_name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "project_name must not be empty");
    }

    let projects = ProjectRepo::new(state.db.clone());
    let project = match projects.get_or_create(&body.project_name) {
        Ok(project) => project,
        Err(err) => return store_error_response(err),
    };

    let conversations = ConversationRepo::new(state.db.clone());
    let supplied_id = body.conversation_id.map(ConversationId::from_raw);
    let conversation =
        match conversations.get_or_create(&project.id, &identity.user_id, supplied_id.as_ref()) {
            Ok(conversation) => conversation,
            Err(err) => return store_error_response(err),
        };

    let Some(guard) = state.orchestrator.try_start(&conversation.id) else {
        return error_response(
            StatusCode::CONFLICT,
            "a turn is already running for this conversation",
        );
    };

    // Subscribe before the turn starts so no frame is missed.
    let rx = state.event_tx.subscribe();

    let request = TurnRequest {
        conversation_id: conversation.id.clone(),
        project_id: project.id,
        user_id: identity.user_id,
        user_email: identity.email,
        content: body.content,
        role: body.role.unwrap_or(Role::User),
    };
    let runner = state.runner.clone();
    let token = guard.token();
    let conversation_id = conversation.id.clone();
    tokio::spawn(async move {
        if let Err(err) = runner.run_turn(request, token).await {
            info!(conversation_id = %conversation_id, error = %err, "turn ended with error");
        }
    });

    let stream = event_stream(rx, guard, conversation.id);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// SSE frames for one conversation, ending after the first terminal frame.
/// The guard travels inside the stream state: dropping the response body
/// drops it, cancelling the turn.
fn event_stream(
    rx: broadcast::Receiver<ChatEvent>,
    guard: crate::orchestrator::TurnGuard,
    conversation_id: ConversationId,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(
        (rx, guard, conversation_id, false),
        |(mut rx, guard, conversation_id, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(event) if event.conversation_id() == &conversation_id => {
                        let terminal = event.is_terminal();
                        let Ok(frame) = Event::default().json_data(&event) else {
                            continue;
                        };
                        return Some((Ok(frame), (rx, guard, conversation_id, terminal)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conversation_id = %conversation_id, skipped, "SSE receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    )
}

/// POST /api/tasks/{id}/generate: claim the single generation slot and
/// run story generation in the background. 202 on claim, 409 when a run
/// is already in flight.
pub async fn post_generate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from_raw(id);

    match state.generation.begin(&task_id) {
        Ok(()) => {}
        Err(waypoint_engine::EngineError::Store(err)) => return store_error_response(err),
        Err(err) => {
            warn!(task_id = %task_id, error = %err, "failed to claim generation slot");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    }

    let generation = state.generation.clone();
    let background_id = task_id.clone();
    tokio::spawn(async move {
        if let Err(err) = generation.generate_stories(&background_id).await {
            warn!(task_id = %background_id, error = %err, "story generation run failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "task_id": task_id.as_str()})),
    )
        .into_response()
}

/// GET /api/tasks/{id}/status: current poll snapshot.
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let tasks = TaskRepo::new(state.db.clone());
    match task_snapshot(&tasks, &TaskId::from_raw(id)) {
        Ok(event) => Json(event).into_response(),
        Err(err) => store_error_response(err),
    }
}

/// GET /api/tasks/{id}/status/stream: the same snapshot re-read at a fixed
/// interval and pushed as SSE frames, ending after the first terminal one.
pub async fn get_task_status_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let task_id = TaskId::from_raw(id);
    let tasks = TaskRepo::new(state.db.clone());

    // Unknown tasks get a 404 up front, not a one-frame stream.
    if let Err(err) = tasks.get(&task_id) {
        return store_error_response(err);
    }

    let watcher = PollWatcher::new(state.poll_interval);
    let stream = watcher
        .watch(move || task_snapshot(&tasks, &task_id))
        .map(|snapshot| {
            let frame = match snapshot {
                Ok(event) => Event::default().json_data(&event),
                Err(err) => {
                    Event::default().json_data(&json!({"type": "error", "data": err.to_string()}))
                }
            };
            Ok::<Event, Infallible>(frame.unwrap_or_default())
        });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// GET /api/deployments/{id}: deployment with its full ordered stage log
/// and initiator/project metadata.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let deployment_id = DeploymentId::from_raw(id);
    let deployments = DeploymentRepo::new(state.db.clone());

    let deployment = match deployments.get(&deployment_id) {
        Ok(deployment) => deployment,
        Err(err) => return store_error_response(err),
    };
    let stages = match deployments.stages(&deployment_id) {
        Ok(stages) => stages,
        Err(err) => return store_error_response(err),
    };

    let projects = ProjectRepo::new(state.db.clone());
    let project = match projects.get(&deployment.project_id) {
        Ok(project) => json!({"id": project.id.as_str(), "name": project.name}),
        // A deployment can outlive its project row in exports; degrade to id only.
        Err(_) => json!({"id": deployment.project_id.as_str()}),
    };

    let stage_log: Vec<Value> = stages
        .iter()
        .map(|row| {
            json!({
                "seq": row.seq,
                "stage": row.stage,
                "status": row.status,
                "tool_name": row.tool_name,
                "log": row.log,
                "metadata": row.metadata,
                "error": row.error,
                "created_at": row.created_at,
            })
        })
        .collect();

    Json(json!({
        "deployment": {
            "id": deployment.id.as_str(),
            "status": deployment.status,
            "created_at": deployment.created_at,
            "updated_at": deployment.updated_at,
        },
        "project": project,
        "initiator": {
            "id": deployment.initiator_id.as_str(),
            "email": deployment.initiator_email,
        },
        "stages": stage_log,
    }))
    .into_response()
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}
