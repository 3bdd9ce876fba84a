//! Canonical enums used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unit-of-work vocabulary. A closed set: dispatch is exhaustive-match,
/// never string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Observation,
    Summarize,
    Embedding,
    ContextGenerate,
    ClaudeMd,
    QdrantSync,
    SemanticSearch,
    Compression,
}

impl TaskType {
    pub const ALL: &'static [TaskType] = &[
        TaskType::Observation,
        TaskType::Summarize,
        TaskType::Embedding,
        TaskType::ContextGenerate,
        TaskType::ClaudeMd,
        TaskType::QdrantSync,
        TaskType::SemanticSearch,
        TaskType::Compression,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Observation => "observation",
            TaskType::Summarize => "summarize",
            TaskType::Embedding => "embedding",
            TaskType::ContextGenerate => "context-generate",
            TaskType::ClaudeMd => "claude-md",
            TaskType::QdrantSync => "qdrant-sync",
            TaskType::SemanticSearch => "semantic-search",
            TaskType::Compression => "compression",
        }
    }

    /// How long an assigned/processing task of this type may run before
    /// the reaper returns it to the queue.
    pub fn timeout(&self) -> Duration {
        match self {
            TaskType::Observation => Duration::from_secs(2 * 60),
            TaskType::Summarize
            | TaskType::Compression
            | TaskType::Embedding
            | TaskType::QdrantSync
            | TaskType::SemanticSearch => Duration::from_secs(5 * 60),
            TaskType::ContextGenerate | TaskType::ClaudeMd => Duration::from_secs(10 * 60),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(TaskType::Observation),
            "summarize" => Ok(TaskType::Summarize),
            "embedding" => Ok(TaskType::Embedding),
            "context-generate" => Ok(TaskType::ContextGenerate),
            "claude-md" => Ok(TaskType::ClaudeMd),
            "qdrant-sync" => Ok(TaskType::QdrantSync),
            "semantic-search" => Ok(TaskType::SemanticSearch),
            "compression" => Ok(TaskType::Compression),
            _ => Err(format!("Invalid task type: '{}'", s)),
        }
    }
}

/// Task lifecycle. `pending -> assigned -> processing -> terminal`; a
/// retryable failure returns to `pending` with `retry_after` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Terminal statuses never transition back to non-terminal ones.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// A task counted against the at-most-one-in-flight invariant.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

/// Session lifecycle as observed from hook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Invalid session status: '{}'", s)),
        }
    }
}

/// What a worker token is allowed to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    /// Any task on this backend instance.
    #[default]
    Instance,
    /// Only tasks routed through the token's hub.
    Group,
    /// Only tasks whose payload project matches the token's filter.
    Project,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::Instance => "instance",
            TokenScope::Group => "group",
            TokenScope::Project => "project",
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TokenScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(TokenScope::Instance),
            "group" => Ok(TokenScope::Group),
            "project" => Ok(TokenScope::Project),
            _ => Err(format!("Invalid token scope: '{}'", s)),
        }
    }
}

/// Registration liveness as tracked by the token service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Online,
    #[default]
    Offline,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Online => "online",
            RegistrationStatus::Offline => "offline",
        }
    }
}

impl FromStr for RegistrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(RegistrationStatus::Online),
            "offline" => Ok(RegistrationStatus::Offline),
            _ => Err(format!("Invalid registration status: '{}'", s)),
        }
    }
}

/// Routing endpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubType {
    Builtin,
    External,
}

impl HubType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubType::Builtin => "builtin",
            HubType::External => "external",
        }
    }
}

impl FromStr for HubType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builtin" => Ok(HubType::Builtin),
            "external" => Ok(HubType::External),
            _ => Err(format!("Invalid hub type: '{}'", s)),
        }
    }
}

/// Hub health as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HubStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubStatus::Healthy => "healthy",
            HubStatus::Degraded => "degraded",
            HubStatus::Unhealthy => "unhealthy",
            HubStatus::Offline => "offline",
        }
    }

    /// Healthy and degraded hubs remain routable.
    pub fn is_routable(&self) -> bool {
        matches!(self, HubStatus::Healthy | HubStatus::Degraded)
    }
}

impl fmt::Display for HubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HubStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HubStatus::Healthy),
            "degraded" => Ok(HubStatus::Degraded),
            "unhealthy" => Ok(HubStatus::Unhealthy),
            "offline" => Ok(HubStatus::Offline),
            _ => Err(format!("Invalid hub status: '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_roundtrip() {
        for ty in TaskType::ALL {
            assert_eq!(ty.as_str().parse::<TaskType>().unwrap(), *ty);
        }
    }

    #[test]
    fn test_task_type_serde_kebab() {
        let json = serde_json::to_string(&TaskType::ContextGenerate).unwrap();
        assert_eq!(json, "\"context-generate\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Processing.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
    }

    #[test]
    fn test_timeouts_ordered_by_type() {
        assert!(TaskType::Observation.timeout() < TaskType::Summarize.timeout());
        assert!(TaskType::Summarize.timeout() < TaskType::ClaudeMd.timeout());
    }
}
