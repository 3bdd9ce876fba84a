//! Trace correlation across hook -> backend -> worker.
//!
//! Context travels explicitly: HTTP headers on the ingress surface, a
//! `trace` sub-object on WS frames. No task-local storage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_SPAN_ID: &str = "x-span-id";
pub const HEADER_PARENT_SPAN_ID: &str = "x-parent-span-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Root context for a request that arrived without trace headers.
    pub fn new_root() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            span_id: short_span_id(),
            parent_span_id: None,
        }
    }

    /// Child span within the same trace, e.g. when an ingested event fans
    /// out into a dispatched task.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: short_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// Rebuild from ingress headers; missing pieces are minted fresh so a
    /// partially-instrumented caller still gets a coherent trace.
    pub fn from_headers(
        request_id: Option<&str>,
        trace_id: Option<&str>,
        span_id: Option<&str>,
    ) -> Self {
        let request_id = request_id
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace_id = trace_id
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent_span_id = span_id.filter(|v| !v.is_empty()).map(str::to_string);
        Self {
            request_id,
            trace_id,
            span_id: short_span_id(),
            parent_span_id,
        }
    }

    /// Header pairs for outbound propagation.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_REQUEST_ID, self.request_id.clone()),
            (HEADER_TRACE_ID, self.trace_id.clone()),
            (HEADER_SPAN_ID, self.span_id.clone()),
        ];
        if let Some(parent) = &self.parent_span_id {
            headers.push((HEADER_PARENT_SPAN_ID, parent.clone()));
        }
        headers
    }
}

fn short_span_id() -> String {
    // 16 hex chars is plenty for intra-trace uniqueness.
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_trace_links_parent() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.request_id, root.request_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn test_from_headers_adopts_incoming_trace() {
        let ctx = TraceContext::from_headers(Some("req-1"), Some("trace-1"), Some("span-1"));
        assert_eq!(ctx.request_id, "req-1");
        assert_eq!(ctx.trace_id, "trace-1");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("span-1"));
    }

    #[test]
    fn test_from_headers_mints_missing_pieces() {
        let ctx = TraceContext::from_headers(None, Some(""), None);
        assert!(!ctx.request_id.is_empty());
        assert!(!ctx.trace_id.is_empty());
        assert!(ctx.parent_span_id.is_none());
    }
}
