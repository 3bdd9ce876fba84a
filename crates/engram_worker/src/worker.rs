//! Worker runtime: one WebSocket connection, one task at a time.
//!
//! Design principles:
//! - The socket is owned directly and split once; all frames flow through
//!   the single run loop, so outbound order follows the protocol.
//! - Handlers run on a spawned task; the loop stays responsive to
//!   heartbeats and `task:cancel` while a task is in flight.
//! - No auto-reconnect: a lost backend ends the run and the caller (or the
//!   next hook process) decides what happens next.

use anyhow::{bail, Context, Result};
use engram_protocol::defaults::{DEFAULT_WORKER_WS_PATH, HEARTBEAT_INTERVAL};
use engram_protocol::messages::{
    AuthPayload, RegistrationInfo, TaskErrorReport, TaskProgressReport, TaskResultReport,
};
use engram_protocol::{HubMessage, TaskId, WorkerId, WorkerMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::handlers::{HandlerError, HandlerRegistry};
use crate::lifecycle::{ExitReason, LifecycleLimits};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Backend base URL, e.g. `http://127.0.0.1:37840` or a full ws URL.
    pub backend_url: String,
    pub token: String,
    pub labels: HashMap<String, String>,
    pub metadata: Value,
    /// Host+pid identity, stable across reconnects of this process.
    pub system_id: String,
}

struct RunningTask {
    task_id: TaskId,
    cancel: CancellationToken,
}

struct TaskOutcome {
    task_id: TaskId,
    result: Result<Value, HandlerError>,
}

/// Connected, authenticated worker.
pub struct Worker {
    worker_id: WorkerId,
    sink: WsSink,
    stream: WsStream,
    registry: Arc<HandlerRegistry>,
}

impl Worker {
    /// Connect, authenticate, and register capabilities.
    pub async fn connect(config: &WorkerConfig, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let url = worker_ws_url(&config.backend_url);
        let (socket, _) = connect_async(&url)
            .await
            .with_context(|| format!("WS connect to {}", url))?;
        let (mut sink, mut stream) = socket.split();

        let auth = WorkerMessage::Auth(AuthPayload {
            token: config.token.clone(),
            registration: RegistrationInfo {
                system_id: config.system_id.clone(),
                capabilities: registry.capabilities(),
                labels: config.labels.clone(),
                metadata: config.metadata.clone(),
            },
        });
        sink.send(WsMessage::Text(auth.to_json()?)).await?;

        let worker_id = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match HubMessage::from_json(&text)? {
                HubMessage::AuthResult(result) if result.success => result
                    .worker_id
                    .context("auth:result success without worker_id")?,
                HubMessage::AuthResult(result) => {
                    bail!("Authentication rejected: {}", result.error.unwrap_or_default())
                }
                other => bail!("Unexpected first frame: {:?}", other),
            },
            other => bail!("Connection closed during handshake ({:?})", other.is_some()),
        };

        info!(worker_id = %worker_id, url = %url, "Worker connected");
        Ok(Self {
            worker_id,
            sink,
            stream,
            registry,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Main event loop. Returns why the worker stopped.
    pub async fn run(&mut self, limits: &LifecycleLimits) -> Result<ExitReason> {
        let started = Instant::now();
        let mut idle_since = Instant::now();
        let mut current: Option<RunningTask> = None;
        let (results_tx, mut results_rx) = mpsc::channel::<TaskOutcome>(1);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending_heartbeat: Option<Instant> = None;
        let mut last_rtt_ms: Option<u32> = None;

        loop {
            let idle_deadline = if current.is_none() {
                idle_since + limits.idle_timeout
            } else {
                // Busy workers never idle out.
                Instant::now() + limits.max_runtime
            };
            let runtime_deadline = started + limits.max_runtime;

            tokio::select! {
                _ = heartbeat.tick() => {
                    pending_heartbeat = Some(Instant::now());
                    self.send(&WorkerMessage::Heartbeat { latency_ms: last_rtt_ms }).await?;
                }

                outcome = results_rx.recv() => {
                    let Some(outcome) = outcome else { continue };
                    self.report_outcome(&outcome).await?;
                    current = None;
                    idle_since = Instant::now();
                }

                frame = self.stream.next() => {
                    let Some(Ok(frame)) = frame else {
                        warn!("Backend connection lost");
                        return Ok(ExitReason::Disconnected);
                    };
                    let text = match frame {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(_) => return Ok(ExitReason::Disconnected),
                        _ => continue,
                    };
                    let message = match HubMessage::from_json(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping malformed hub frame: {}", e);
                            continue;
                        }
                    };

                    match message {
                        HubMessage::TaskAssign(assignment) => {
                            if let Some(running) = &current {
                                warn!(
                                    task_id = %assignment.task_id,
                                    busy_with = %running.task_id,
                                    "Assignment while busy; refusing"
                                );
                                self.send(&WorkerMessage::TaskError(TaskErrorReport {
                                    task_id: assignment.task_id,
                                    error: "worker busy".to_string(),
                                    retryable: true,
                                    cancelled: false,
                                    trace: None,
                                })).await?;
                                continue;
                            }

                            info!(task_id = %assignment.task_id, capability = %assignment.capability, "Task received");
                            self.send(&WorkerMessage::TaskProgress(TaskProgressReport {
                                task_id: assignment.task_id.clone(),
                                message: Some("started".to_string()),
                                percent: Some(0),
                            })).await?;

                            let cancel = CancellationToken::new();
                            match self.registry.get(&assignment.capability) {
                                Some(handler) => {
                                    let tx = results_tx.clone();
                                    let task_id = assignment.task_id.clone();
                                    let payload = assignment.payload.clone();
                                    let token = cancel.clone();
                                    current = Some(RunningTask {
                                        task_id: assignment.task_id.clone(),
                                        cancel,
                                    });
                                    tokio::spawn(async move {
                                        let result = handler.handle(&payload, &token).await;
                                        let _ = tx.send(TaskOutcome { task_id, result }).await;
                                    });
                                }
                                None => {
                                    error!(capability = %assignment.capability, "No handler for assigned capability");
                                    self.send(&WorkerMessage::TaskError(TaskErrorReport {
                                        task_id: assignment.task_id,
                                        error: format!("no handler for capability {}", assignment.capability),
                                        retryable: false,
                                        cancelled: false,
                                        trace: None,
                                    })).await?;
                                }
                            }
                        }

                        HubMessage::TaskCancel { task_id, reason } => {
                            match &current {
                                Some(running) if running.task_id == task_id => {
                                    info!(task_id = %task_id, reason = ?reason, "Cancelling current task");
                                    running.cancel.cancel();
                                }
                                _ => debug!(task_id = %task_id, "Cancel for a task we are not running"),
                            }
                        }

                        HubMessage::HeartbeatAck => {
                            if let Some(sent) = pending_heartbeat.take() {
                                last_rtt_ms = Some(sent.elapsed().as_millis().min(u32::MAX as u128) as u32);
                            }
                        }

                        HubMessage::ServerShutdown { reason } => {
                            info!(reason = ?reason, "Server requested shutdown");
                            if let Some(running) = &current {
                                running.cancel.cancel();
                            }
                            return Ok(ExitReason::Shutdown);
                        }

                        HubMessage::ConfigUpdate { config } => {
                            debug!("Config update received: {}", config);
                        }

                        HubMessage::AuthResult(_) => {
                            debug!("Ignoring duplicate auth:result");
                        }
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline.into()), if current.is_none() => {
                    info!("Idle timeout reached; exiting");
                    self.send(&WorkerMessage::Shutdown).await.ok();
                    return Ok(ExitReason::Idle);
                }

                _ = tokio::time::sleep_until(runtime_deadline.into()) => {
                    info!("Max runtime reached; exiting");
                    if let Some(running) = &current {
                        running.cancel.cancel();
                    }
                    self.send(&WorkerMessage::Shutdown).await.ok();
                    return Ok(ExitReason::MaxRuntime);
                }
            }
        }
    }

    async fn report_outcome(&mut self, outcome: &TaskOutcome) -> Result<()> {
        match &outcome.result {
            Ok(result) => {
                info!(task_id = %outcome.task_id, "Task complete");
                self.send(&WorkerMessage::TaskComplete(TaskResultReport {
                    task_id: outcome.task_id.clone(),
                    result: result.clone(),
                    trace: None,
                }))
                .await
            }
            Err(error) => {
                warn!(task_id = %outcome.task_id, "Task failed: {}", error);
                self.send(&WorkerMessage::TaskError(TaskErrorReport {
                    task_id: outcome.task_id.clone(),
                    error: error.to_string(),
                    retryable: error.is_retryable(),
                    cancelled: error.is_cancelled(),
                    trace: None,
                }))
                .await
            }
        }
    }

    async fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        self.sink
            .send(WsMessage::Text(message.to_json()?))
            .await
            .context("WS send failed")?;
        Ok(())
    }
}

/// Derive the worker WS URL from a backend base URL.
pub fn worker_ws_url(backend_url: &str) -> String {
    if backend_url.starts_with("ws://") || backend_url.starts_with("wss://") {
        return backend_url.to_string();
    }
    let base = backend_url.trim_end_matches('/');
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}{}", swapped, DEFAULT_WORKER_WS_PATH)
}
