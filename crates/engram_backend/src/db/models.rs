//! Row types and row-to-record conversion helpers.
//!
//! Timestamps are RFC 3339 TEXT columns; JSON columns hold serde output.
//! Conversion is manual `try_get` so enum and JSON parsing failures surface
//! as decode errors with a column name instead of a silent default.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use engram_protocol::http::{HubView, TaskView};
use engram_protocol::{
    HubId, HubStatus, HubType, SessionId, SessionStatus, TaskId, TaskStatus, TaskType, TraceContext,
    WorkerId,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

/// A task as stored in `engram_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub assigned_worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub dedup_key: Option<String>,
    pub trace: Option<TraceContext>,
}

impl TaskRecord {
    /// Capabilities in assignment order: required first, then fallbacks.
    pub fn capability_preference(&self) -> Vec<&str> {
        let mut caps = vec![self.required_capability.as_str()];
        caps.extend(self.fallback_capabilities.iter().map(String::as_str));
        caps
    }

    /// Project the payload declares, used for project-scoped tokens.
    pub fn project(&self) -> Option<&str> {
        self.payload.get("project").and_then(|v| v.as_str())
    }

    /// Optional routing hints carried in the payload.
    pub fn region(&self) -> Option<&str> {
        self.payload.get("region").and_then(|v| v.as_str())
    }

    pub fn to_view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            task_type: self.task_type,
            status: self.status,
            required_capability: self.required_capability.clone(),
            fallback_capabilities: self.fallback_capabilities.clone(),
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            assigned_worker_id: self.assigned_worker_id.clone(),
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            completed_at: self.completed_at,
            retry_after: self.retry_after,
            error: self.error.clone(),
        }
    }
}

/// A session as stored in `engram_sessions`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub prompt_counter: i64,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub cwd: Option<String>,
    pub is_worktree: bool,
    pub plan_mode: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// A hub as stored in `engram_hubs`.
#[derive(Debug, Clone, PartialEq)]
pub struct HubRecord {
    pub id: HubId,
    pub name: String,
    pub hub_type: HubType,
    pub endpoint: Option<String>,
    pub priority: i64,
    pub weight: i64,
    pub region: Option<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Option<Vec<String>>,
    pub status: HubStatus,
    pub connected_workers: i64,
    pub active_workers: i64,
    pub avg_latency_ms: Option<f64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HubRecord {
    /// A hub with no declared capabilities is a wildcard.
    pub fn supports(&self, capability: &str) -> bool {
        match &self.capabilities {
            None => true,
            Some(caps) => caps.iter().any(|c| c == capability),
        }
    }

    pub fn to_view(&self) -> HubView {
        HubView {
            id: self.id.clone(),
            name: self.name.clone(),
            hub_type: self.hub_type,
            endpoint: self.endpoint.clone(),
            priority: self.priority,
            weight: self.weight,
            region: self.region.clone(),
            labels: self.labels.clone(),
            capabilities: self.capabilities.clone(),
            status: self.status,
            connected_workers: self.connected_workers,
            active_workers: self.active_workers,
            avg_latency_ms: self.avg_latency_ms,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

// ============================================================================
// Column helpers
// ============================================================================

pub(crate) fn ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", value))
}

pub(crate) fn opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(ts).transpose()
}

pub(crate) fn json_list(value: &str) -> Result<Vec<String>> {
    serde_json::from_str(value).with_context(|| format!("Invalid JSON list in database: {}", value))
}

pub(crate) fn json_map(value: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(value).with_context(|| format!("Invalid JSON map in database: {}", value))
}

// ============================================================================
// Row conversions
// ============================================================================

pub(crate) fn row_to_task(row: &SqliteRow) -> Result<TaskRecord> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let fallbacks: String = row.try_get("fallback_capabilities")?;
    let result: Option<String> = row.try_get("result")?;
    let trace: Option<String> = row.try_get("trace")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(TaskRecord {
        id: TaskId::from_raw(row.try_get::<String, _>("id")?),
        task_type: task_type.parse().map_err(|e: String| anyhow!(e))?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        required_capability: row.try_get("required_capability")?,
        fallback_capabilities: json_list(&fallbacks)?,
        priority: row.try_get("priority")?,
        payload: serde_json::from_str(&payload).context("Invalid task payload JSON")?,
        result: result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid task result JSON")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        assigned_worker_id: row
            .try_get::<Option<String>, _>("assigned_worker_id")?
            .map(WorkerId::from_raw),
        created_at: ts(&created_at)?,
        assigned_at: opt_ts(row.try_get("assigned_at")?)?,
        completed_at: opt_ts(row.try_get("completed_at")?)?,
        retry_after: opt_ts(row.try_get("retry_after")?)?,
        dedup_key: row.try_get("dedup_key")?,
        trace: trace
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid task trace JSON")?,
    })
}

pub(crate) fn row_to_session(row: &SqliteRow) -> Result<SessionRecord> {
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let last_activity_at: String = row.try_get("last_activity_at")?;

    Ok(SessionRecord {
        id: SessionId::from_raw(row.try_get::<String, _>("id")?),
        content_session_id: row.try_get("content_session_id")?,
        memory_session_id: row.try_get("memory_session_id")?,
        project: row.try_get("project")?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        started_at: ts(&started_at)?,
        completed_at: opt_ts(row.try_get("completed_at")?)?,
        prompt_counter: row.try_get("prompt_counter")?,
        git_repo: row.try_get("git_repo")?,
        git_branch: row.try_get("git_branch")?,
        cwd: row.try_get("cwd")?,
        is_worktree: row.try_get::<i64, _>("is_worktree")? != 0,
        plan_mode: row.try_get::<i64, _>("plan_mode")? != 0,
        last_activity_at: ts(&last_activity_at)?,
    })
}

pub(crate) fn row_to_hub(row: &SqliteRow) -> Result<HubRecord> {
    let hub_type: String = row.try_get("hub_type")?;
    let status: String = row.try_get("status")?;
    let labels: String = row.try_get("labels")?;
    let capabilities: Option<String> = row.try_get("capabilities")?;

    Ok(HubRecord {
        id: HubId::new(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        hub_type: hub_type.parse().map_err(|e: String| anyhow!(e))?,
        endpoint: row.try_get("endpoint")?,
        priority: row.try_get("priority")?,
        weight: row.try_get("weight")?,
        region: row.try_get("region")?,
        labels: json_map(&labels)?,
        capabilities: capabilities.as_deref().map(json_list).transpose()?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        connected_workers: row.try_get("connected_workers")?,
        active_workers: row.try_get("active_workers")?,
        avg_latency_ms: row.try_get("avg_latency_ms")?,
        last_heartbeat: opt_ts(row.try_get("last_heartbeat")?)?,
    })
}
