//! Federation client: dispatch to external hubs.
//!
//! The backend speaks the worker WS grammar toward external hubs: it
//! authenticates like a worker, pushes `task:assign` frames, and ingests
//! `task:complete` / `task:error` back into the local queue. Assignments
//! claimed for an external hub run under a synthetic worker id so the
//! ordinary reaper covers a hub that dies mid-task. Health is pushed over
//! HTTP with an `X-Hub-Token` header.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use engram_protocol::http::HubHealthReport;
use engram_protocol::messages::{AuthPayload, RegistrationInfo, TaskAssignment};
use engram_protocol::{HubId, HubMessage, WorkerId, WorkerMessage};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::db::models::{HubRecord, TaskRecord};
use crate::db::queue::TaskQueue;

const HUB_TOKEN_HEADER: &str = "X-Hub-Token";

type ConnectionMap = Arc<Mutex<HashMap<HubId, mpsc::UnboundedSender<HubMessage>>>>;

pub struct FederationClient {
    queue: TaskQueue,
    dispatch_signal: Arc<Notify>,
    http: reqwest::Client,
    hub_token: String,
    connections: ConnectionMap,
}

impl FederationClient {
    pub fn new(queue: TaskQueue, dispatch_signal: Arc<Notify>, hub_token: String) -> Self {
        Self {
            queue,
            dispatch_signal,
            http: reqwest::Client::new(),
            hub_token,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Synthetic worker identity an external hub's assignments run under.
    pub fn hub_worker_id(hub_id: &HubId) -> WorkerId {
        WorkerId::from_raw(format!("hub:{}", hub_id))
    }

    /// Forward `task` to an external hub. Returns false when the hub is
    /// unreachable or refuses, so the caller falls through to the next
    /// candidate.
    pub async fn dispatch(&self, hub: &HubRecord, task: &TaskRecord) -> Result<bool> {
        let Some(sender) = self.connection(hub).await else {
            return Ok(false);
        };

        let worker_id = Self::hub_worker_id(&hub.id);
        if !self.queue.claim(&task.id, &worker_id, Utc::now()).await? {
            // Someone else claimed it; nothing left to route.
            return Ok(true);
        }

        let frame = HubMessage::TaskAssign(TaskAssignment {
            task_id: task.id.clone(),
            task_type: task.task_type,
            capability: task.required_capability.clone(),
            payload: task.payload.clone(),
            trace: task.trace.as_ref().map(|t| t.child()),
        });

        if sender.send(frame).is_err() {
            self.connections.lock().await.remove(&hub.id);
            self.queue.release(&task.id, &worker_id).await?;
            return Ok(false);
        }

        debug!(task_id = %task.id, hub_id = %hub.id, "Task federated");
        Ok(true)
    }

    /// Reuse or establish the WS connection to a hub.
    async fn connection(&self, hub: &HubRecord) -> Option<mpsc::UnboundedSender<HubMessage>> {
        {
            let connections = self.connections.lock().await;
            if let Some(sender) = connections.get(&hub.id) {
                if !sender.is_closed() {
                    return Some(sender.clone());
                }
            }
        }

        match self.connect(hub).await {
            Ok(sender) => {
                self.connections
                    .lock()
                    .await
                    .insert(hub.id.clone(), sender.clone());
                Some(sender)
            }
            Err(e) => {
                warn!(hub_id = %hub.id, "Failed to connect to external hub: {}", e);
                None
            }
        }
    }

    async fn connect(&self, hub: &HubRecord) -> Result<mpsc::UnboundedSender<HubMessage>> {
        let endpoint = hub
            .endpoint
            .as_deref()
            .context("External hub has no endpoint")?;
        let (socket, _) = connect_async(endpoint)
            .await
            .with_context(|| format!("WS connect to {}", endpoint))?;
        let (mut sink, mut stream) = socket.split();

        // Worker grammar verbatim: first frame is auth carrying the hub
        // token.
        let auth = WorkerMessage::Auth(AuthPayload {
            token: self.hub_token.clone(),
            registration: RegistrationInfo {
                system_id: format!("backend:{}", std::process::id()),
                capabilities: Vec::new(),
                labels: HashMap::new(),
                metadata: serde_json::json!({"role": "federation"}),
            },
        });
        sink.send(WsMessage::Text(auth.to_json()?)).await?;

        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let frame =
                    HubMessage::from_json(&text).context("Invalid auth response frame")?;
                match frame {
                    HubMessage::AuthResult(result) if result.success => {}
                    HubMessage::AuthResult(result) => {
                        bail!("Hub rejected federation auth: {:?}", result.error)
                    }
                    other => bail!("Unexpected first frame from hub: {:?}", other),
                }
            }
            _ => bail!("Hub closed during auth handshake"),
        }

        info!(hub_id = %hub.id, endpoint, "Federated hub connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<HubMessage>();

        // Writer: outbound assignment frames.
        let writer_hub = hub.id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Ok(text) = frame.to_json() else { continue };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    debug!(hub_id = %writer_hub, "Federated hub writer closed");
                    break;
                }
            }
        });

        // Reader: results flowing back from the hub. Owns clones of the
        // handles it needs; the client itself is not captured.
        let queue = self.queue.clone();
        let signal = Arc::clone(&self.dispatch_signal);
        let connections = Arc::clone(&self.connections);
        let reader_hub = hub.id.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match WorkerMessage::from_json(&text) {
                    Ok(message) => apply_hub_result(&queue, &signal, &reader_hub, message).await,
                    Err(e) => warn!(hub_id = %reader_hub, "Malformed frame from hub: {}", e),
                }
            }
            connections.lock().await.remove(&reader_hub);
            info!(hub_id = %reader_hub, "Federated hub disconnected");
        });

        Ok(tx)
    }

    /// Periodic health push to an external hub.
    pub async fn push_health(&self, hub: &HubRecord, report: &HubHealthReport) -> Result<()> {
        let endpoint = hub
            .endpoint
            .as_deref()
            .context("External hub has no endpoint")?;
        let url = format!("{}/hub/health", http_base_from_ws(endpoint)?);
        self.http
            .post(&url)
            .header(HUB_TOKEN_HEADER, &self.hub_token)
            .json(report)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?
            .error_for_status()
            .context("Hub health push rejected")?;
        Ok(())
    }
}

async fn apply_hub_result(
    queue: &TaskQueue,
    signal: &Notify,
    hub_id: &HubId,
    message: WorkerMessage,
) {
    match message {
        WorkerMessage::TaskComplete(report) => {
            if let Err(e) = queue.complete(&report.task_id, &report.result).await {
                warn!(task_id = %report.task_id, "Failed to apply federated completion: {}", e);
            }
            signal.notify_one();
        }
        WorkerMessage::TaskError(report) => {
            let retryable = report.retryable && !report.cancelled;
            if let Err(e) = queue.fail(&report.task_id, &report.error, retryable).await {
                warn!(task_id = %report.task_id, "Failed to apply federated error: {}", e);
            }
            signal.notify_one();
        }
        WorkerMessage::TaskProgress(report) => {
            let worker_id = FederationClient::hub_worker_id(hub_id);
            if let Err(e) = queue.mark_processing(&report.task_id, &worker_id).await {
                warn!(task_id = %report.task_id, "Failed to mark federated progress: {}", e);
            }
        }
        other => debug!(hub_id = %hub_id, "Ignoring hub frame: {:?}", other),
    }
}

/// `ws://host:port/ws/worker` -> `http://host:port` (and wss -> https).
fn http_base_from_ws(endpoint: &str) -> Result<String> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .context("Endpoint has no scheme")?;
    let http_scheme = match scheme {
        "ws" => "http",
        "wss" => "https",
        other => bail!("Unsupported hub endpoint scheme: {}", other),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    Ok(format!("{}://{}", http_scheme, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base_from_ws() {
        assert_eq!(
            http_base_from_ws("ws://hub.example:37840/ws/worker").unwrap(),
            "http://hub.example:37840"
        );
        assert_eq!(
            http_base_from_ws("wss://hub.example/ws/worker").unwrap(),
            "https://hub.example"
        );
        assert!(http_base_from_ws("tcp://hub.example:5555").is_err());
    }

    #[test]
    fn test_hub_worker_id_is_stable() {
        let hub = HubId::new("hub-eu");
        assert_eq!(
            FederationClient::hub_worker_id(&hub),
            FederationClient::hub_worker_id(&hub)
        );
        assert_eq!(FederationClient::hub_worker_id(&hub).as_str(), "hub:hub-eu");
    }
}
