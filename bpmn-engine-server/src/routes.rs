//! §6 External Interfaces: the inbound command surface, the AG-UI event
//! stream, and the webhook surface. Grounded on the teacher's
//! `ob-poc-web/src/routes.rs` handler-per-file layout, adapted from its
//! Postgres/axum handlers to this engine's `Engine`/`MessageQueue` API.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bpmn_engine_core::events::EventCategory;
use bpmn_engine_core::instance::InstanceId;
use bpmn_engine_core::runners::UserTaskDecision;
use bpmn_engine_core::types::{ProcessGraph, Value};
use bpmn_engine_core::{compiler, webhook};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{BadRequest, HandlerError};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/instances", post(start_instance))
        .route("/instances/:instance_id", get(get_instance))
        .route("/instances/:instance_id/events", get(stream_events))
        .route("/instances/:instance_id/cancel", post(cancel_instance))
        .route("/instances/:instance_id/clear-history", post(clear_history))
        .route("/instances/:instance_id/replay", post(replay))
        .route(
            "/instances/:instance_id/user-tasks/:element_id/complete",
            post(complete_user_task),
        )
        .route("/webhooks/message", post(ingest_named))
        .route("/webhooks/:message_ref/:correlation_key", post(ingest_path))
        .route("/webhooks/queue/stats", get(queue_stats))
        .route("/webhooks/queue/:correlation_key", get(queue_peek).delete(queue_clear))
        .with_state(state)
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, BadRequest> {
    Uuid::parse_str(raw).map_err(|e| BadRequest(format!("invalid instance id: {e}")))
}

// ---- Inbound command surface -------------------------------------------

#[derive(Deserialize)]
pub struct StartInstanceRequest {
    pub process_graph: ProcessGraph,
    #[serde(default)]
    pub context: Value,
}

#[derive(Serialize)]
pub struct StartInstanceResponse {
    pub instance_id: InstanceId,
}

async fn start_instance(
    State(state): State<AppState>,
    Json(body): Json<StartInstanceRequest>,
) -> Result<Json<StartInstanceResponse>, BadRequest> {
    let graph = body.process_graph.finish_deserialize();
    let errors = compiler::verify(&graph);
    if !errors.is_empty() {
        let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(BadRequest(format!("process graph invalid: {joined}")));
    }

    let instance_id = state
        .engine
        .clone()
        .start_instance(Arc::new(graph), body.context)
        .await
        .map_err(|e| BadRequest(e.to_string()))?;

    Ok(Json(StartInstanceResponse { instance_id }))
}

#[derive(Serialize)]
pub struct InstanceStatusResponse {
    pub instance_id: InstanceId,
    pub outcome: Option<bpmn_engine_core::InstanceOutcome>,
    pub context: Option<Value>,
}

async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceStatusResponse>, BadRequest> {
    let instance_id = parse_instance_id(&instance_id)?;
    let outcome = state.engine.instance_outcome(instance_id).await;
    let context = state.engine.instance_context(instance_id).await;
    Ok(Json(InstanceStatusResponse { instance_id, outcome, context }))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

async fn cancel_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<(), HandlerError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state.engine.clone().cancel_instance(instance_id, body.reason).await?;
    Ok(())
}

#[derive(Deserialize)]
pub struct ElementIdBody {
    pub element_id: String,
}

async fn clear_history(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<ElementIdBody>,
) -> Result<(), BadRequest> {
    let instance_id = parse_instance_id(&instance_id)?;
    webhook::clear_history(state.engine.broadcaster(), instance_id, &body.element_id)
        .await
        .map_err(|e| BadRequest(e.to_string()))
}

async fn replay(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<ElementIdBody>,
) -> Result<(), BadRequest> {
    let instance_id = parse_instance_id(&instance_id)?;
    webhook::replay(state.engine.broadcaster(), instance_id, &body.element_id)
        .await
        .map_err(|e| BadRequest(e.to_string()))
}

#[derive(Deserialize)]
pub struct CompleteUserTaskRequest {
    pub decision: String,
    #[serde(default)]
    pub comments: Option<String>,
}

async fn complete_user_task(
    State(state): State<AppState>,
    Path((instance_id, element_id)): Path<(String, String)>,
    Json(body): Json<CompleteUserTaskRequest>,
) -> Result<(), HandlerError> {
    let instance_id = parse_instance_id(&instance_id)?;
    state
        .engine
        .complete_user_task(
            instance_id,
            &element_id,
            UserTaskDecision { decision: body.decision, comments: body.comments },
        )
        .await?;
    Ok(())
}

// ---- AG-UI event stream --------------------------------------------------

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Comma-separated category names, e.g. `?categories=messaging,tool`.
    pub categories: Option<String>,
}

fn parse_categories(raw: &str) -> Vec<EventCategory> {
    raw.split(',')
        .filter_map(|s| match s.trim() {
            "messaging" => Some(EventCategory::Messaging),
            "tool" => Some(EventCategory::Tool),
            "state" => Some(EventCategory::State),
            "lifecycle" => Some(EventCategory::Lifecycle),
            "special" => Some(EventCategory::Special),
            other => {
                warn!(category = other, "unrecognized AG-UI event category in stream filter");
                None
            }
        })
        .collect()
}

async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, BadRequest> {
    let instance_id = parse_instance_id(&instance_id)?;
    let filter = query.categories.as_deref().map(parse_categories);
    Ok(ws.on_upgrade(move |socket| forward_events(socket, state, instance_id, filter)))
}

async fn forward_events(
    mut socket: WebSocket,
    state: AppState,
    instance_id: InstanceId,
    filter: Option<Vec<EventCategory>>,
) {
    let mut subscription = state.engine.broadcaster().subscribe(instance_id, filter);
    while let Some(event) = subscription.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize AG-UI event for websocket subscriber");
                continue;
            }
        };
        if socket.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

// ---- Webhook HTTP surface (§6) -------------------------------------------

#[derive(Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub delivered: bool,
    #[serde(rename = "messageRef")]
    pub message_ref: String,
    #[serde(rename = "correlationKey")]
    pub correlation_key: String,
}

impl From<webhook::IngestResult> for IngestResponse {
    fn from(r: webhook::IngestResult) -> Self {
        Self { status: "received", delivered: r.delivered, message_ref: r.message_ref, correlation_key: r.correlation_key }
    }
}

async fn ingest_path(
    State(state): State<AppState>,
    Path((message_ref, correlation_key)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Json<IngestResponse> {
    let result = webhook::ingest(state.engine.queue(), &message_ref, &correlation_key, payload).await;
    Json(result.into())
}

#[derive(Deserialize)]
pub struct IngestMessageRequest {
    #[serde(rename = "messageRef")]
    pub message_ref: String,
    #[serde(rename = "correlationKey")]
    pub correlation_key: String,
    pub payload: Value,
}

async fn ingest_named(
    State(state): State<AppState>,
    Json(body): Json<IngestMessageRequest>,
) -> Json<IngestResponse> {
    let result =
        webhook::ingest(state.engine.queue(), &body.message_ref, &body.correlation_key, body.payload).await;
    Json(result.into())
}

async fn queue_stats(State(state): State<AppState>) -> Json<bpmn_engine_core::message_queue::QueueStats> {
    Json(state.engine.queue().stats().await)
}

#[derive(Serialize)]
pub struct QueuePeekResponse {
    pub correlation_key: String,
    pub queued: usize,
    pub waiting: usize,
}

async fn queue_peek(
    State(state): State<AppState>,
    Path(correlation_key): Path<String>,
) -> Json<QueuePeekResponse> {
    let stats = state.engine.queue().stats().await;
    Json(QueuePeekResponse {
        queued: *stats.queued_counts.get(&correlation_key).unwrap_or(&0),
        waiting: *stats.waiting_counts.get(&correlation_key).unwrap_or(&0),
        correlation_key,
    })
}

async fn queue_clear(State(state): State<AppState>, Path(correlation_key): Path<String>) -> impl IntoResponse {
    state.engine.queue().clear(&correlation_key).await;
    axum::http::StatusCode::NO_CONTENT
}
