//! Backend HTTP client for hook processes.
//!
//! Delivery policy: try the live backend first; any failure lands the
//! event in the offline queue and the hook reports success to the editor.
//! Replay is cooperative - it runs at most once per process at a time and
//! never blocks the event that triggered it.

use anyhow::{Context, Result};
use engram_protocol::defaults::{
    HOOK_HEALTH_TIMEOUT, OFFLINE_SYNC_BATCH, OFFLINE_SYNC_ENTRY_TIMEOUT,
    SLOW_HOST_TIMEOUT_MULTIPLIER,
};
use engram_protocol::http::HealthResponse;
use engram_protocol::TraceContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::offline_queue::OfflineQueue;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Bearer token in remote mode.
    pub api_token: Option<String>,
    /// Applies the slow-host multiplier to every timeout.
    pub slow_host: bool,
}

impl ClientConfig {
    fn scale(&self, timeout: Duration) -> Duration {
        if self.slow_host {
            timeout.mul_f64(SLOW_HOST_TIMEOUT_MULTIPLIER)
        } else {
            timeout
        }
    }
}

/// How an event left the hook process.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Delivered to the live backend; response body included.
    Sent(serde_json::Value),
    /// Backend unreachable; captured in the offline queue.
    Queued(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub delivered: usize,
    pub failed: usize,
    pub evicted: usize,
}

pub struct BackendClient {
    http: reqwest::Client,
    config: ClientConfig,
    queue: OfflineQueue,
    sync_in_flight: AtomicBool,
}

impl BackendClient {
    pub fn new(config: ClientConfig, queue: OfflineQueue) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.scale(OFFLINE_SYNC_ENTRY_TIMEOUT))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            queue,
            sync_in_flight: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Fast health probe; anything but a 2xx `coreReady` is "down".
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.config.base_url.trim_end_matches('/'));
        let request = self
            .http
            .get(&url)
            .timeout(self.config.scale(HOOK_HEALTH_TIMEOUT));
        match request.send().await {
            Ok(response) if response.status().is_success() => response
                .json::<HealthResponse>()
                .await
                .map(|body| body.core_ready)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Deliver one hook event, falling back to the offline queue. The
    /// caller never sees a delivery failure.
    pub async fn send_or_enqueue(
        &self,
        event_type: &str,
        path: &str,
        payload: serde_json::Value,
        trace: &TraceContext,
    ) -> Result<Delivery> {
        match self.post(path, &payload, Some(trace)).await {
            Ok(body) => Ok(Delivery::Sent(body)),
            Err(e) => {
                debug!("Delivery failed, queueing {}: {}", event_type, e);
                let id = self.queue.enqueue(event_type, path, payload)?;
                info!(entry_id = %id, event_type, "Hook event captured offline");
                Ok(Delivery::Queued(id))
            }
        }
    }

    /// Replay queued events FIFO. Cooperative: a no-op when a sync is
    /// already running, the queue is empty, or the backend is down.
    pub async fn sync(&self) -> Result<SyncReport> {
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SyncReport::default());
        }
        let report = self.sync_inner().await;
        self.sync_in_flight.store(false, Ordering::SeqCst);
        report
    }

    async fn sync_inner(&self) -> Result<SyncReport> {
        if self.queue.is_empty() {
            return Ok(SyncReport::default());
        }
        if !self.health().await {
            debug!("Backend not healthy; skipping offline sync");
            return Ok(SyncReport::default());
        }

        let batch = self.queue.peek(OFFLINE_SYNC_BATCH);
        let mut delivered = Vec::new();
        let mut failed = Vec::new();

        for entry in &batch {
            match self.post(&entry.path, &entry.payload, None).await {
                Ok(_) => delivered.push(entry.id.clone()),
                Err(e) => {
                    // A failed entry does not block later entries in the
                    // batch.
                    warn!(entry_id = %entry.id, "Offline replay failed: {}", e);
                    failed.push(entry.id.clone());
                }
            }
        }

        self.queue.remove(&delivered)?;
        let evicted = self.queue.mark_retried(&failed)?;

        let report = SyncReport {
            delivered: delivered.len(),
            failed: failed.len(),
            evicted: evicted.len(),
        };
        if report.delivered > 0 || report.failed > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                evicted = report.evicted,
                remaining = self.queue.len(),
                "Offline sync pass finished"
            );
        }
        Ok(report)
    }

    async fn post(
        &self,
        path: &str,
        payload: &serde_json::Value,
        trace: Option<&TraceContext>,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            path
        );
        let mut request = self.http.post(&url).json(payload);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(trace) = trace {
            for (name, value) in trace.to_headers() {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("POST {} returned {}", url, status);
        }
        response
            .json::<serde_json::Value>()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client(dir: &TempDir, base_url: &str) -> BackendClient {
        let queue = OfflineQueue::open(&dir.path().join("offline.jsonl")).unwrap();
        BackendClient::new(
            ClientConfig {
                base_url: base_url.to_string(),
                api_token: None,
                slow_host: false,
            },
            queue,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_backend_queues_event() {
        let dir = TempDir::new().unwrap();
        // Reserved TEST-NET address: connection fails fast.
        let client = client(&dir, "http://192.0.2.1:1");

        let delivery = client
            .send_or_enqueue(
                "observation",
                "/api/hooks/observation",
                serde_json::json!({"tool_name": "Edit"}),
                &TraceContext::new_root(),
            )
            .await
            .unwrap();

        assert!(matches!(delivery, Delivery::Queued(_)));
        assert_eq!(client.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_skips_when_backend_down() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir, "http://192.0.2.1:1");
        client
            .queue()
            .enqueue("observation", "/api/hooks/observation", serde_json::json!({}))
            .unwrap();

        let report = client.sync().await.unwrap();
        assert_eq!(report, SyncReport::default());
        // The entry stays queued; no retry was counted against it.
        assert_eq!(client.queue().len(), 1);
        assert_eq!(client.queue().peek(1)[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_sync_noop_on_empty_queue() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir, "http://192.0.2.1:1");
        assert_eq!(client.sync().await.unwrap(), SyncReport::default());
    }

    #[test]
    fn test_slow_host_scales_timeouts() {
        let config = ClientConfig {
            base_url: "http://localhost".to_string(),
            api_token: None,
            slow_host: true,
        };
        assert_eq!(
            config.scale(Duration::from_secs(2)),
            Duration::from_secs(3)
        );
    }
}
