//! HTTP surface: hook ingress, admin endpoints, SSE stream, and the
//! worker WebSocket upgrade.
//!
//! The surface is deliberately small; everything of substance lives in the
//! services this module calls into.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_protocol::http::{
    CreateTokenRequest, CreateTokenResponse, DomainEvent, EnqueueResponse, ErrorResponse,
    HealthResponse, HubHealthReport, HubView, ObservationRequest, RegisterHubRequest,
    SessionInitRequest, SessionInitResponse, SummarizeRequest, TaskView, TokenView,
};
use engram_protocol::trace::{HEADER_REQUEST_ID, HEADER_SPAN_ID, HEADER_TRACE_ID};
use engram_protocol::{dedup, ErrorKind, HubId, TaskId, TokenId, TraceContext};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::queue::{NewTask, TaskQueue};
use crate::db::sessions::SessionStore;
use crate::events::EventBus;
use crate::hub::WorkerHub;
use crate::registry::HubRegistry;
use crate::tokens::TokenService;

/// Capability vocabulary the backend attaches to the tasks it creates.
const OBSERVATION_CAPABILITY: &str = "observation:sdk";
const OBSERVATION_FALLBACK: &str = "observation:basic";
const SUMMARIZE_CAPABILITY: &str = "summarize:local";
const SUMMARIZE_PRIORITY: i64 = 5;

#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub sessions: SessionStore,
    pub tokens: TokenService,
    pub registry: HubRegistry,
    pub hub: Arc<WorkerHub>,
    pub bus: EventBus,
    pub dispatch_signal: Arc<Notify>,
    /// Bearer token required on /api routes in remote mode.
    pub api_token: Option<Arc<String>>,
    /// Shared secret external hubs present on /hub/health.
    pub hub_token: Option<Arc<String>>,
    pub version: &'static str,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/hooks/session-init", post(session_init))
        .route("/hooks/observation", post(observation))
        .route("/hooks/summarize", post(summarize))
        .route("/events/stream", get(events_stream))
        .route("/worker-tokens", post(create_token).get(list_tokens))
        .route("/worker-tokens/:id", get(get_token).delete(revoke_token))
        .route("/hubs", post(register_hub).get(list_hubs))
        .route("/hubs/:id", axum::routing::put(update_hub).delete(remove_hub))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/queue/stats", get(queue_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/api/health", get(health))
        .nest("/api", api)
        .route("/hub/health", post(hub_health))
        .route("/ws/worker", get(worker_socket))
        .layer(middleware::from_fn(echo_request_id))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Auth(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, ErrorKind::Validation, message)
            }
            ApiError::Auth(message) => (StatusCode::UNAUTHORIZED, ErrorKind::Auth, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, ErrorKind::NotFound, message),
            ApiError::Internal(error) => {
                warn!("Internal API error: {:#}", error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorKind::Internal,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse::new(kind, message))).into_response()
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Echo (or mint) `X-Request-ID` on every response.
async fn echo_request_id(request: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

/// Remote mode requires `Authorization: Bearer <token>` on /api routes.
/// Local mode (no token configured) trusts the localhost bind.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected.as_str() => next.run(request).await,
        _ => ApiError::Auth("missing or invalid bearer token".to_string()).into_response(),
    }
}

fn trace_from(headers: &HeaderMap) -> TraceContext {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    TraceContext::from_headers(get(HEADER_REQUEST_ID), get(HEADER_TRACE_ID), get(HEADER_SPAN_ID))
}

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        core_ready: true,
        version: state.version.to_string(),
        connected_workers: state.hub.connected_count().await,
    })
}

// ============================================================================
// Hook ingress
// ============================================================================

async fn session_init(
    State(state): State<AppState>,
    Json(req): Json<SessionInitRequest>,
) -> Result<Json<SessionInitResponse>, ApiError> {
    if req.content_session_id.is_empty() {
        return Err(ApiError::Validation("content_session_id is required".into()));
    }
    if req.project.is_empty() {
        return Err(ApiError::Validation("project is required".into()));
    }

    let (session_id, created) = state.sessions.init_session(&req).await?;
    if !created {
        // The init hook fires per user prompt; a repeat init is the next
        // prompt in an existing session.
        state.sessions.record_prompt(&req.content_session_id).await?;
    }
    Ok(Json(SessionInitResponse { session_id, created }))
}

async fn observation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ObservationRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if req.content_session_id.is_empty() {
        return Err(ApiError::Validation("content_session_id is required".into()));
    }
    if req.tool_name.is_empty() {
        return Err(ApiError::Validation("tool_name is required".into()));
    }

    state.sessions.record_activity(&req.content_session_id).await?;

    // Secret-filter skip: the ingestion succeeds, nothing is stored.
    if req.skipped {
        debug!(session = %req.content_session_id, tool = %req.tool_name, "Observation skipped by filter");
        return Ok(Json(EnqueueResponse {
            task_id: None,
            was_new: false,
            skipped: true,
        }));
    }

    let dedup_key = dedup::observation_key(
        &req.content_session_id,
        req.prompt_number,
        &req.tool_name,
        &req.tool_input,
    );
    let trace = trace_from(&headers);
    let payload = serde_json::json!({
        "session_id": req.content_session_id,
        "project": req.project,
        "prompt_number": req.prompt_number,
        "tool_name": req.tool_name,
        "tool_input": req.tool_input,
        "tool_output": req.tool_output,
        "git_branch": req.git_branch,
        "cwd": req.cwd,
    });

    let task = NewTask::new(engram_protocol::TaskType::Observation, OBSERVATION_CAPABILITY, payload)
        .fallbacks(vec![OBSERVATION_FALLBACK.to_string()])
        .dedup_key(dedup_key)
        .trace(trace);
    let (task_id, was_new) = state.queue.enqueue(task).await?;
    state.dispatch_signal.notify_one();

    Ok(Json(EnqueueResponse {
        task_id: Some(task_id),
        was_new,
        skipped: false,
    }))
}

async fn summarize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SummarizeRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if req.content_session_id.is_empty() {
        return Err(ApiError::Validation("content_session_id is required".into()));
    }

    let payload = serde_json::json!({
        "session_id": req.content_session_id,
        "project": req.project,
    });
    let task = NewTask::new(engram_protocol::TaskType::Summarize, SUMMARIZE_CAPABILITY, payload)
        .priority(SUMMARIZE_PRIORITY)
        .dedup_key(dedup::summarize_key(&req.content_session_id))
        .trace(trace_from(&headers));
    let (task_id, was_new) = state.queue.enqueue(task).await?;
    state.dispatch_signal.notify_one();

    if req.session_ending {
        state
            .sessions
            .complete(&req.content_session_id, engram_protocol::SessionStatus::Completed)
            .await?;
    }

    Ok(Json(EnqueueResponse {
        task_id: Some(task_id),
        was_new,
        skipped: false,
    }))
}

// ============================================================================
// SSE event stream
// ============================================================================

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_string(&event) else {
                        continue;
                    };
                    let sse = SseEvent::default().event(event_name(&event)).data(data);
                    return Some((Ok(sse), rx));
                }
                // A slow subscriber loses the oldest events and continues.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("SSE subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_name(event: &DomainEvent) -> &'static str {
    match event {
        DomainEvent::TaskQueued { .. } => "task:queued",
        DomainEvent::TaskAssigned { .. } => "task:assigned",
        DomainEvent::TaskCompleted { .. } => "task:completed",
        DomainEvent::TaskFailed { .. } => "task:failed",
        DomainEvent::SessionStarted { .. } => "session:started",
        DomainEvent::SessionCompleted { .. } => "session:completed",
        DomainEvent::WorkerConnected { .. } => "worker:connected",
        DomainEvent::WorkerDisconnected { .. } => "worker:disconnected",
    }
}

// ============================================================================
// Worker tokens
// ============================================================================

async fn create_token(
    State(state): State<AppState>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::Validation("name is required".into()));
    }
    let (record, plain_token) = state.tokens.create(&req).await?;
    Ok(Json(CreateTokenResponse {
        token: record.to_view(),
        plain_token,
    }))
}

async fn list_tokens(State(state): State<AppState>) -> Result<Json<Vec<TokenView>>, ApiError> {
    let tokens = state.tokens.list().await?;
    Ok(Json(tokens.iter().map(|t| t.to_view()).collect()))
}

async fn get_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TokenView>, ApiError> {
    let id = TokenId::from_raw(id);
    let token = state
        .tokens
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown token {}", id)))?;
    Ok(Json(token.to_view()))
}

async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = TokenId::from_raw(id);
    if state.tokens.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown token {}", id)));
    }
    state.tokens.revoke(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Hubs
// ============================================================================

async fn register_hub(
    State(state): State<AppState>,
    Json(req): Json<RegisterHubRequest>,
) -> Result<Json<HubView>, ApiError> {
    if req.endpoint.is_empty() {
        return Err(ApiError::Validation("endpoint is required".into()));
    }
    let hub = state.registry.register_hub(&req).await?;
    Ok(Json(hub.to_view()))
}

async fn list_hubs(State(state): State<AppState>) -> Result<Json<Vec<HubView>>, ApiError> {
    let hubs = state.registry.list_hubs().await?;
    Ok(Json(hubs.iter().map(|h| h.to_view()).collect()))
}

async fn update_hub(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterHubRequest>,
) -> Result<StatusCode, ApiError> {
    let id = HubId::new(id);
    let updated = state
        .registry
        .update_hub(&id, &req)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown hub {}", id)))
    }
}

async fn remove_hub(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = HubId::new(id);
    let removed = state
        .registry
        .remove_hub(&id)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown hub {}", id)))
    }
}

/// External hubs push their health here with the shared hub token.
async fn hub_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<HubHealthReport>,
) -> Result<StatusCode, ApiError> {
    if let Some(expected) = &state.hub_token {
        let presented = headers.get("x-hub-token").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err(ApiError::Auth("invalid hub token".into()));
        }
    }
    let known = state.registry.update_health(&report).await?;
    if !known {
        return Err(ApiError::NotFound(format!("unknown hub {}", report.hub_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Tasks & queue
// ============================================================================

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let id = TaskId::from_raw(id);
    let task = state
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown task {}", id)))?;
    Ok(Json(task.to_view()))
}

#[derive(Debug, serde::Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<StatusCode, ApiError> {
    let id = TaskId::from_raw(id);
    if state.queue.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown task {}", id)));
    }
    let reason = body.and_then(|Json(req)| req.reason);
    state.hub.cancel_task(&id, reason).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<engram_protocol::http::QueueStatsResponse>, ApiError> {
    Ok(Json(state.queue.count_by_status().await?))
}

// ============================================================================
// Worker WebSocket
// ============================================================================

async fn worker_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| hub.serve_socket(socket))
}
