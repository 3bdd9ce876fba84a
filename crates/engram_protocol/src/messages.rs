//! WebSocket frame grammar between hub and workers.
//!
//! JSON frames, UTF-8, tagged by a `type` field. The same grammar is spoken
//! by the backend toward external hubs when federating an assignment.

use crate::ids::{TaskId, WorkerId};
use crate::trace::TraceContext;
use crate::types::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registration details carried by the worker's first (`auth`) frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Host+pid identity, stable across reconnects of the same process.
    pub system_id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Arbitrary worker metadata; `spawned_id` marks backend-spawned
    /// workers that drain after a single task.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    pub registration: RegistrationInfo,
}

/// Outcome of the auth handshake, sent as the hub's first frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A task pushed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub capability: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: TaskId,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorReport {
    pub task_id: TaskId,
    pub error: String,
    pub retryable: bool,
    /// Set when the error is a response to `task:cancel`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgressReport {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 0..=100 when the handler can estimate it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
}

/// Frames a worker sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "heartbeat")]
    Heartbeat {
        /// Milliseconds the worker measured for its previous
        /// heartbeat round-trip, used for latency scoring.
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u32>,
    },
    #[serde(rename = "task:complete")]
    TaskComplete(TaskResultReport),
    #[serde(rename = "task:error")]
    TaskError(TaskErrorReport),
    #[serde(rename = "task:progress")]
    TaskProgress(TaskProgressReport),
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Frames the hub sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    #[serde(rename = "auth:result")]
    AuthResult(AuthResult),
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck,
    #[serde(rename = "task:assign")]
    TaskAssign(TaskAssignment),
    #[serde(rename = "task:cancel")]
    TaskCancel {
        task_id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "server:shutdown")]
    ServerShutdown {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "config:update")]
    ConfigUpdate { config: serde_json::Value },
}

impl WorkerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl HubMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
