//! HTTP API types for the hook ingress and admin surface.
//!
//! These types are used by the backend HTTP server and its clients (hook
//! binary, admin tooling). All types use serde for JSON serialization with
//! strict enum tagging.

use crate::ids::{HubId, SessionId, TaskId, TokenId, WorkerId};
use crate::types::{HubStatus, HubType, SessionStatus, TaskStatus, TaskType, TokenScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Hook ingress
// ============================================================================

/// `POST /api/hooks/session-init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInitRequest {
    /// Editor-assigned session identity; unique across all sessions.
    pub content_session_id: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub is_worktree: bool,
    #[serde(default)]
    pub plan_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInitResponse {
    pub session_id: SessionId,
    /// False when an active session for this content id already existed.
    pub created: bool,
}

/// `POST /api/hooks/observation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRequest {
    pub content_session_id: String,
    pub project: String,
    pub prompt_number: i64,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Set by the hook's secret filter: the event was accepted but its
    /// sensitive content intentionally not stored.
    #[serde(default)]
    pub skipped: bool,
}

/// `POST /api/hooks/summarize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeRequest {
    pub content_session_id: String,
    pub project: String,
    /// Stop hook sets this; the session is completed after the summary
    /// task is enqueued.
    #[serde(default)]
    pub session_ending: bool,
}

/// Response for both observation and summarize ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// Absent when the event was accepted but intentionally not stored
    /// (secret-filter skip).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// False on a dedup hit: the id refers to the earlier task.
    pub was_new: bool,
    #[serde(default)]
    pub skipped: bool,
}

/// `GET /api/health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(rename = "coreReady")]
    pub core_ready: bool,
    pub version: String,
    pub connected_workers: usize,
}

// ============================================================================
// Worker tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default)]
    pub scope: TokenScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<HubId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_filter: Option<String>,
    /// When set, worker-declared capabilities are intersected with this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The only response that ever carries the plaintext token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token: TokenView,
    pub plain_token: String,
}

/// Token record as exposed over the API; never includes the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenView {
    pub id: TokenId,
    pub name: String,
    pub token_prefix: String,
    pub scope: TokenScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<HubId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Hubs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterHubRequest {
    pub name: String,
    /// WebSocket URL of the external hub's worker endpoint.
    pub endpoint: String,
    #[serde(default = "default_hub_priority")]
    pub priority: i64,
    #[serde(default = "default_hub_weight")]
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_hub_priority() -> i64 {
    50
}

fn default_hub_weight() -> i64 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubView {
    pub id: HubId,
    pub name: String,
    pub hub_type: HubType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub priority: i64,
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    pub status: HubStatus,
    pub connected_workers: i64,
    pub active_workers: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// `POST /hub/health` body pushed by the backend to external hubs, and by
/// external hubs back to the backend registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubHealthReport {
    pub hub_id: HubId,
    pub status: HubStatus,
    pub connected_workers: i64,
    pub active_workers: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

// ============================================================================
// Tasks & queue
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub pending: i64,
    pub assigned: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
}

// ============================================================================
// Domain events (SSE stream)
// ============================================================================

/// Events fanned out to `/api/events/stream` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskQueued {
        task_id: TaskId,
        task_type: TaskType,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        will_retry: bool,
    },
    SessionStarted {
        session_id: SessionId,
        project: String,
    },
    SessionCompleted {
        session_id: SessionId,
        status: SessionStatus,
    },
    WorkerConnected {
        worker_id: WorkerId,
        capabilities: Vec<String>,
    },
    WorkerDisconnected {
        worker_id: WorkerId,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Structured 4xx/5xx body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: crate::error::ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: crate::error::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: code.as_str().to_string(),
            message: message.into(),
            code,
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_uses_camel_case_flag() {
        let json = serde_json::to_string(&HealthResponse {
            core_ready: true,
            version: "0.1.0".into(),
            connected_workers: 2,
        })
        .unwrap();
        assert!(json.contains("\"coreReady\":true"));
    }

    #[test]
    fn test_domain_event_tagging() {
        let event = DomainEvent::TaskFailed {
            task_id: TaskId::new(),
            error: "upstream".into(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"task_failed\""));
    }
}
