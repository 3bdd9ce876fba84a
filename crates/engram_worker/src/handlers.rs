//! Task handlers and their registry.
//!
//! A handler owns one capability. The shipped handlers are the
//! deterministic fallbacks (`observation:basic`, `summarize:local`);
//! AI-provider-backed handlers implement the same trait and register
//! richer capabilities like `observation:sdk`.

use async_trait::async_trait;
use engram_protocol::TaskType;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::cancel::CancellationToken;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; the backend may retry the task.
    #[error("{0}")]
    Retryable(String),
    /// Permanent failure; retrying would reproduce it.
    #[error("{0}")]
    Fatal(String),
    /// The handler observed the abort signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandlerError::Cancelled)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Capability string this handler serves, e.g. `observation:basic`.
    fn capability(&self) -> &str;

    fn task_type(&self) -> TaskType;

    /// Process one task payload. Must observe `cancel` at every
    /// suspension point.
    async fn handle(&self, payload: &Value, cancel: &CancellationToken)
        -> Result<Value, HandlerError>;
}

/// Capability -> handler map declared at worker startup.
#[derive(Default)]
pub struct HandlerRegistry {
    by_capability: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.by_capability
            .insert(handler.capability().to_string(), handler);
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn TaskHandler>> {
        self.by_capability.get(capability).cloned()
    }

    /// Capabilities declared during the auth handshake, sorted for a
    /// stable wire appearance.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.by_capability.keys().cloned().collect();
        caps.sort();
        caps
    }

    /// Registry with the deterministic built-in handlers.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ObservationExtractor));
        registry.register(Arc::new(SessionDigest));
        registry
    }
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// Deterministic observation extraction from a tool invocation: no model
/// call, just the structured facts the payload already carries.
pub struct ObservationExtractor;

#[async_trait]
impl TaskHandler for ObservationExtractor {
    fn capability(&self) -> &str {
        "observation:basic"
    }

    fn task_type(&self) -> TaskType {
        TaskType::Observation
    }

    async fn handle(
        &self,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, HandlerError> {
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let tool_name = payload
            .get("tool_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::Fatal("payload missing tool_name".to_string()))?;
        let tool_input = payload.get("tool_input").cloned().unwrap_or(Value::Null);

        let mut files = Vec::new();
        collect_paths(&tool_input, &mut files);
        files.sort();
        files.dedup();

        let command = tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let observation = serde_json::json!({
            "session_id": payload.get("session_id"),
            "project": payload.get("project"),
            "tool_name": tool_name,
            "files_touched": files,
            "command": command,
            "git_branch": payload.get("git_branch"),
        });
        Ok(serde_json::json!({"observation": observation}))
    }
}

/// Walk a tool-input value collecting anything that looks like a path.
fn collect_paths(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.starts_with('/') || s.starts_with("./") => out.push(s.clone()),
        Value::Object(map) => {
            for (key, nested) in map {
                if key.ends_with("path") || key.ends_with("file") {
                    if let Some(s) = nested.as_str() {
                        out.push(s.to_string());
                        continue;
                    }
                }
                collect_paths(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, out);
            }
        }
        _ => {}
    }
}

/// Deterministic session digest: aggregates the observations the backend
/// put in the payload.
pub struct SessionDigest;

#[async_trait]
impl TaskHandler for SessionDigest {
    fn capability(&self) -> &str {
        "summarize:local"
    }

    fn task_type(&self) -> TaskType {
        TaskType::Summarize
    }

    async fn handle(
        &self,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, HandlerError> {
        if cancel.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let session_id = payload
            .get("session_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::Fatal("payload missing session_id".to_string()))?;

        let observations = payload
            .get("observations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut tools: HashMap<String, u64> = HashMap::new();
        let mut files = Vec::new();
        for obs in &observations {
            if let Some(tool) = obs.get("tool_name").and_then(|v| v.as_str()) {
                *tools.entry(tool.to_string()).or_default() += 1;
            }
            if let Some(touched) = obs.get("files_touched").and_then(|v| v.as_array()) {
                for file in touched {
                    if let Some(s) = file.as_str() {
                        files.push(s.to_string());
                    }
                }
            }
        }
        files.sort();
        files.dedup();

        Ok(serde_json::json!({
            "session_id": session_id,
            "summary": {
                "observation_count": observations.len(),
                "tool_counts": tools,
                "files_touched": files,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observation_extractor_collects_paths() {
        let handler = ObservationExtractor;
        let payload = serde_json::json!({
            "session_id": "s1",
            "project": "demo",
            "tool_name": "Edit",
            "tool_input": {
                "file_path": "/work/demo/src/lib.rs",
                "old_string": "a",
                "new_string": "b"
            },
        });

        let result = handler
            .handle(&payload, &CancellationToken::new())
            .await
            .unwrap();
        let files = result["observation"]["files_touched"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0], "/work/demo/src/lib.rs");
    }

    #[tokio::test]
    async fn test_observation_extractor_missing_tool_is_fatal() {
        let handler = ObservationExtractor;
        let result = handler
            .handle(&serde_json::json!({}), &CancellationToken::new())
            .await;
        match result {
            Err(error) => assert!(!error.is_retryable()),
            Ok(_) => panic!("expected fatal error"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let handler = SessionDigest;
        let token = CancellationToken::new();
        token.cancel();
        let result = handler
            .handle(&serde_json::json!({"session_id": "s1"}), &token)
            .await;
        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_session_digest_counts_tools() {
        let handler = SessionDigest;
        let payload = serde_json::json!({
            "session_id": "s1",
            "observations": [
                {"tool_name": "Edit", "files_touched": ["/a.rs"]},
                {"tool_name": "Edit", "files_touched": ["/a.rs", "/b.rs"]},
                {"tool_name": "Bash"},
            ],
        });

        let result = handler
            .handle(&payload, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["summary"]["observation_count"], 3);
        assert_eq!(result["summary"]["tool_counts"]["Edit"], 2);
        assert_eq!(
            result["summary"]["files_touched"],
            serde_json::json!(["/a.rs", "/b.rs"])
        );
    }

    #[test]
    fn test_registry_capabilities_sorted() {
        let registry = HandlerRegistry::with_builtin_handlers();
        assert_eq!(
            registry.capabilities(),
            vec!["observation:basic".to_string(), "summarize:local".to_string()]
        );
        assert!(registry.get("observation:basic").is_some());
        assert!(registry.get("observation:sdk").is_none());
    }
}
