//! Worker hub: the WebSocket control plane.
//!
//! Owns the connected-worker table exclusively and is the sole mutator of
//! `current_task_id`. A connection is authenticated by its first frame,
//! kept alive by heartbeats, and fed at most one task at a time. All frame
//! shapes live in `engram_protocol::messages`.

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use engram_protocol::defaults::{
    AUTH_HANDSHAKE_TIMEOUT, CANCEL_GRACE_PERIOD, CLOSE_AUTH_FAILED, CLOSE_HEARTBEAT_TIMEOUT,
    HEARTBEAT_INTERVAL, HEARTBEAT_MAX_MISSES,
};
use engram_protocol::http::DomainEvent;
use engram_protocol::{
    AuthPayload, AuthResult, HubId, HubMessage, TaskAssignment, TaskId, TaskType, WorkerId,
    WorkerMessage,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::db::models::TaskRecord;
use crate::db::queue::TaskQueue;
use crate::events::EventBus;
use crate::registry::LocalHubTelemetry;
use crate::tokens::{TokenScopeContext, TokenService};

/// Smoothing factor for the per-worker heartbeat latency EMA.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Authenticated live session of a worker registration.
#[derive(Debug)]
pub struct ConnectedWorker {
    pub worker_id: WorkerId,
    pub registration_id: String,
    pub scope: TokenScopeContext,
    pub capabilities: Vec<String>,
    pub labels: HashMap<String, String>,
    pub metadata: serde_json::Value,
    sender: mpsc::UnboundedSender<HubMessage>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<(TaskId, TaskType)>,
    pub pending_termination: bool,
    pub latency_ema_ms: Option<f64>,
}

impl ConnectedWorker {
    fn is_idle(&self) -> bool {
        self.current_task.is_none() && !self.pending_termination
    }

    fn observe_latency(&mut self, sample_ms: f64) {
        self.latency_ema_ms = Some(match self.latency_ema_ms {
            Some(ema) => ema + LATENCY_EMA_ALPHA * (sample_ms - ema),
            None => sample_ms,
        });
    }

    /// Backend-spawned workers carry a `spawned_id` in their metadata and
    /// are drained after a single task.
    pub fn spawned_id(&self) -> Option<&str> {
        self.metadata.get("spawned_id").and_then(|v| v.as_str())
    }
}

/// Outcome of a local assignment attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignOutcome {
    Assigned(WorkerId),
    /// No idle worker covers the task's capability preference.
    NoCapableWorker,
    /// Someone else claimed the task first.
    AlreadyClaimed,
}

pub struct WorkerHub {
    hub_id: HubId,
    queue: TaskQueue,
    tokens: TokenService,
    bus: EventBus,
    dispatch: Arc<Notify>,
    workers: RwLock<HashMap<WorkerId, ConnectedWorker>>,
}

impl WorkerHub {
    pub fn new(
        queue: TaskQueue,
        tokens: TokenService,
        bus: EventBus,
        dispatch: Arc<Notify>,
    ) -> Self {
        Self {
            hub_id: HubId::builtin(),
            queue,
            tokens,
            bus,
            dispatch,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn hub_id(&self) -> &HubId {
        &self.hub_id
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Drive one worker socket from upgrade to close.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();

        // First frame must be auth within the handshake window.
        let auth = match tokio::time::timeout(AUTH_HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await
        {
            Ok(Some(WorkerMessage::Auth(payload))) => payload,
            Ok(_) => {
                warn!("Worker socket sent a non-auth first frame");
                close_with(&mut sink, CLOSE_AUTH_FAILED, "auth required").await;
                return;
            }
            Err(_) => {
                debug!("Worker socket auth handshake timed out");
                close_with(&mut sink, CLOSE_AUTH_FAILED, "auth timeout").await;
                return;
            }
        };

        let worker_id = WorkerId::new();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        match self.authenticate(&auth, &worker_id, outbound_tx).await {
            Ok(()) => {
                let result = HubMessage::AuthResult(AuthResult {
                    success: true,
                    worker_id: Some(worker_id.clone()),
                    error: None,
                });
                if send_frame(&mut sink, &result).await.is_err() {
                    self.disconnect(&worker_id).await;
                    return;
                }
            }
            Err(reason) => {
                let result = HubMessage::AuthResult(AuthResult {
                    success: false,
                    worker_id: None,
                    error: Some(reason),
                });
                let _ = send_frame(&mut sink, &result).await;
                close_with(&mut sink, CLOSE_AUTH_FAILED, "auth failed").await;
                return;
            }
        }

        // A fresh capable worker may unblock pending tasks.
        self.dispatch.notify_one();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    // A dropped sender means the hub reaped this worker.
                    let Some(frame) = outbound else {
                        close_with(&mut sink, CLOSE_HEARTBEAT_TIMEOUT, "reaped").await;
                        break;
                    };
                    let is_shutdown = matches!(frame, HubMessage::ServerShutdown { .. });
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                    if is_shutdown {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
                inbound = read_frame(&mut stream) => {
                    let Some(message) = inbound else { break };
                    if let Err(e) = self.handle_message(&worker_id, message).await {
                        warn!(worker_id = %worker_id, "Error handling worker frame: {}", e);
                    }
                }
            }
        }

        self.disconnect(&worker_id).await;
    }

    async fn authenticate(
        &self,
        auth: &AuthPayload,
        worker_id: &WorkerId,
        sender: mpsc::UnboundedSender<HubMessage>,
    ) -> std::result::Result<(), String> {
        let token = self
            .tokens
            .validate(&auth.token)
            .await
            .map_err(|e| e.to_string())?;

        let (registration, capabilities) = self
            .tokens
            .register_worker(
                &token,
                &auth.registration.system_id,
                worker_id,
                &auth.registration.capabilities,
                &auth.registration.labels,
                &auth.registration.metadata,
            )
            .await
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        let worker = ConnectedWorker {
            worker_id: worker_id.clone(),
            registration_id: registration.id,
            scope: TokenScopeContext {
                token_id: token.id.clone(),
                scope: token.scope,
                hub_id: token.hub_id.clone(),
                project_filter: token.project_filter.clone(),
            },
            capabilities: capabilities.clone(),
            labels: auth.registration.labels.clone(),
            metadata: auth.registration.metadata.clone(),
            sender,
            connected_at: now,
            last_heartbeat: now,
            current_task: None,
            pending_termination: false,
            latency_ema_ms: None,
        };

        self.workers.write().await.insert(worker_id.clone(), worker);
        info!(worker_id = %worker_id, system_id = %auth.registration.system_id, "Worker authenticated");
        self.bus.emit(DomainEvent::WorkerConnected {
            worker_id: worker_id.clone(),
            capabilities,
        });
        Ok(())
    }

    /// Remove a worker and fast-reap its in-flight task.
    pub async fn disconnect(&self, worker_id: &WorkerId) {
        let removed = self.workers.write().await.remove(worker_id);
        let Some(worker) = removed else { return };

        if let Err(e) = self.tokens.mark_offline(&worker.registration_id).await {
            warn!(worker_id = %worker_id, "Failed to mark registration offline: {}", e);
        }
        if let Some((task_id, _)) = worker.current_task {
            if let Err(e) = self.queue.release(&task_id, worker_id).await {
                warn!(task_id = %task_id, "Failed to release task on disconnect: {}", e);
            }
            self.dispatch.notify_one();
        }

        info!(worker_id = %worker_id, "Worker disconnected");
        self.bus.emit(DomainEvent::WorkerDisconnected {
            worker_id: worker_id.clone(),
        });
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    pub(crate) async fn handle_message(&self, worker_id: &WorkerId, message: WorkerMessage) -> Result<()> {
        match message {
            WorkerMessage::Auth(_) => {
                warn!(worker_id = %worker_id, "Duplicate auth frame ignored");
                Ok(())
            }
            WorkerMessage::Heartbeat { latency_ms } => self.handle_heartbeat(worker_id, latency_ms).await,
            WorkerMessage::TaskProgress(report) => {
                // First progress confirms the worker picked the task up.
                self.queue.mark_processing(&report.task_id, worker_id).await?;
                Ok(())
            }
            WorkerMessage::TaskComplete(report) => {
                self.queue.complete(&report.task_id, &report.result).await?;
                self.finish_task(worker_id, &report.task_id).await;
                Ok(())
            }
            WorkerMessage::TaskError(report) => {
                let retryable = report.retryable && !report.cancelled;
                self.queue.fail(&report.task_id, &report.error, retryable).await?;
                self.finish_task(worker_id, &report.task_id).await;
                Ok(())
            }
            WorkerMessage::Shutdown => {
                self.handle_worker_shutdown(worker_id).await;
                Ok(())
            }
        }
    }

    async fn handle_heartbeat(&self, worker_id: &WorkerId, latency_ms: Option<u32>) -> Result<()> {
        let registration_id = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Ok(());
            };
            worker.last_heartbeat = Utc::now();
            if let Some(sample) = latency_ms {
                worker.observe_latency(sample as f64);
            }
            let _ = worker.sender.send(HubMessage::HeartbeatAck);
            worker.registration_id.clone()
        };
        self.tokens.heartbeat(&registration_id).await?;
        Ok(())
    }

    /// Clear the worker's slot after completion or error; drain it if
    /// termination is pending, otherwise let the dispatcher refill it.
    async fn finish_task(&self, worker_id: &WorkerId, task_id: &TaskId) {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            return;
        };
        match &worker.current_task {
            Some((current, _)) if current == task_id => {
                worker.current_task = None;
            }
            _ => {
                debug!(worker_id = %worker_id, task_id = %task_id, "Result for a task the hub no longer tracks");
            }
        }

        // Backend-spawned workers exist for exactly one task.
        if worker.spawned_id().is_some() {
            worker.pending_termination = true;
        }

        if worker.pending_termination {
            let _ = worker.sender.send(HubMessage::ServerShutdown {
                reason: Some("pending termination".to_string()),
            });
        } else {
            drop(workers);
            self.dispatch.notify_one();
        }
    }

    async fn handle_worker_shutdown(&self, worker_id: &WorkerId) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            if worker.current_task.is_none() {
                let _ = worker.sender.send(HubMessage::ServerShutdown {
                    reason: Some("drain acknowledged".to_string()),
                });
            } else {
                // Busy worker announced shutdown: let the in-flight task
                // finish, then drain.
                worker.pending_termination = true;
            }
        }
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Try to hand `task` to an idle capable worker. Candidates are ranked
    /// by latency EMA with random tie-breaking; the claim is the atomic
    /// pending -> assigned flip in the queue.
    pub async fn try_assign(&self, task: &TaskRecord) -> Result<AssignOutcome> {
        for capability in task.capability_preference() {
            let candidates = self.rank_candidates(task, capability).await;
            for worker_id in candidates {
                match self.assign_to(task, &worker_id, capability).await? {
                    AssignOutcome::Assigned(id) => return Ok(AssignOutcome::Assigned(id)),
                    AssignOutcome::AlreadyClaimed => return Ok(AssignOutcome::AlreadyClaimed),
                    AssignOutcome::NoCapableWorker => continue,
                }
            }
        }
        Ok(AssignOutcome::NoCapableWorker)
    }

    async fn rank_candidates(&self, task: &TaskRecord, capability: &str) -> Vec<WorkerId> {
        let workers = self.workers.read().await;
        let mut candidates: Vec<(WorkerId, Option<f64>)> = workers
            .values()
            .filter(|w| w.is_idle())
            .filter(|w| w.capabilities.iter().any(|c| c == capability))
            .filter(|w| w.scope.permits(task, &self.hub_id))
            .map(|w| (w.worker_id.clone(), w.latency_ema_ms))
            .collect();
        drop(workers);

        // Shuffle first so equal-latency workers are picked fairly, then
        // order by latency; unmeasured workers sort last.
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by(|a, b| {
            let a = a.1.unwrap_or(f64::MAX);
            let b = b.1.unwrap_or(f64::MAX);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.into_iter().map(|(id, _)| id).collect()
    }

    async fn assign_to(
        &self,
        task: &TaskRecord,
        worker_id: &WorkerId,
        capability: &str,
    ) -> Result<AssignOutcome> {
        // Reserve the worker slot before the claim so concurrent dispatch
        // iterations cannot double-book it.
        {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Ok(AssignOutcome::NoCapableWorker);
            };
            if !worker.is_idle() {
                return Ok(AssignOutcome::NoCapableWorker);
            }
            worker.current_task = Some((task.id.clone(), task.task_type));
        }

        if !self.queue.claim(&task.id, worker_id, Utc::now()).await? {
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                if worker.current_task.as_ref().map(|(id, _)| id) == Some(&task.id) {
                    worker.current_task = None;
                }
            }
            return Ok(AssignOutcome::AlreadyClaimed);
        }

        let assignment = HubMessage::TaskAssign(TaskAssignment {
            task_id: task.id.clone(),
            task_type: task.task_type,
            capability: capability.to_string(),
            payload: task.payload.clone(),
            trace: task.trace.as_ref().map(|t| t.child()),
        });

        let delivered = {
            let workers = self.workers.read().await;
            workers
                .get(worker_id)
                .map(|w| w.sender.send(assignment).is_ok())
                .unwrap_or(false)
        };

        if !delivered {
            // Socket went away between claim and send: fast-reap.
            warn!(task_id = %task.id, worker_id = %worker_id, "Assigned worker vanished before delivery");
            self.queue.release(&task.id, worker_id).await?;
            let mut workers = self.workers.write().await;
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.current_task = None;
            }
            return Ok(AssignOutcome::NoCapableWorker);
        }

        debug!(task_id = %task.id, worker_id = %worker_id, capability, "Task assigned");
        Ok(AssignOutcome::Assigned(worker_id.clone()))
    }

    // ========================================================================
    // Cancellation & termination
    // ========================================================================

    /// Best-effort cancellation. Sends `task:cancel` to the holder and arms
    /// a grace timer; if the worker does not answer in time the task is
    /// failed locally and the worker treated as stuck.
    pub async fn cancel_task(&self, task_id: &TaskId, reason: Option<String>) -> Result<bool> {
        let holder = {
            let workers = self.workers.read().await;
            workers
                .values()
                .find(|w| w.current_task.as_ref().map(|(id, _)| id) == Some(task_id))
                .map(|w| (w.worker_id.clone(), w.sender.clone()))
        };

        let Some((worker_id, sender)) = holder else {
            // Not held by any worker: cancel it on the queue if it is
            // still pending.
            return self.queue.cancel_pending(task_id, reason.as_deref()).await;
        };

        let _ = sender.send(HubMessage::TaskCancel {
            task_id: task_id.clone(),
            reason,
        });

        let queue = self.queue.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_GRACE_PERIOD).await;
            let still_in_flight = match queue.get(&task_id).await {
                Ok(Some(task)) => task.status.is_in_flight(),
                _ => false,
            };
            if !still_in_flight {
                return;
            }

            warn!(task_id = %task_id, worker_id = %worker_id, "Cancel grace expired; failing task and reaping worker");
            if let Err(e) = queue.fail(&task_id, "cancelled (grace expired)", false).await {
                warn!(task_id = %task_id, "Failed to fail task after cancel grace: {}", e);
            }
            // The worker ignored the cancel: treat it as stuck.
            let _ = sender.send(HubMessage::ServerShutdown {
                reason: Some("unresponsive to cancellation".to_string()),
            });
        });
        Ok(true)
    }

    /// Flag a worker to be shut down after its current (or next completed)
    /// task. Flagged workers receive no new assignments.
    pub async fn flag_pending_termination(&self, worker_id: &WorkerId) -> bool {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            return false;
        };
        worker.pending_termination = true;
        if worker.current_task.is_none() {
            let _ = worker.sender.send(HubMessage::ServerShutdown {
                reason: Some("pending termination".to_string()),
            });
        }
        true
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Drop workers whose last heartbeat is older than the miss budget.
    /// Their in-flight tasks re-enter the queue with `retry_count + 1`.
    pub async fn reap_dead_workers(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let budget = HEARTBEAT_INTERVAL * HEARTBEAT_MAX_MISSES;
        let cutoff = now
            - ChronoDuration::from_std(budget).unwrap_or_else(|_| ChronoDuration::seconds(90));

        let stale: Vec<WorkerId> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.last_heartbeat < cutoff)
                .map(|w| w.worker_id.clone())
                .collect()
        };

        for worker_id in &stale {
            warn!(worker_id = %worker_id, "Reaping worker: heartbeat timeout");
            self.disconnect(worker_id).await;
        }
        stale
    }

    /// Telemetry snapshot feeding the builtin hub's registry row.
    pub async fn telemetry(&self) -> LocalHubTelemetry {
        let workers = self.workers.read().await;
        let connected = workers.len() as i64;
        let active = workers.values().filter(|w| w.current_task.is_some()).count() as i64;

        let latencies: Vec<f64> = workers.values().filter_map(|w| w.latency_ema_ms).collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        let mut capabilities: Vec<String> = workers
            .values()
            .flat_map(|w| w.capabilities.iter().cloned())
            .collect();
        capabilities.sort();
        capabilities.dedup();

        LocalHubTelemetry {
            connected_workers: connected,
            active_workers: active,
            avg_latency_ms,
            capabilities,
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn worker_for_task(&self, task_id: &TaskId) -> Option<WorkerId> {
        let workers = self.workers.read().await;
        workers
            .values()
            .find(|w| w.current_task.as_ref().map(|(id, _)| id) == Some(task_id))
            .map(|w| w.worker_id.clone())
    }

    // Test seam: attach a worker without a socket.
    #[cfg(test)]
    pub(crate) async fn attach_for_test(
        &self,
        capabilities: Vec<String>,
        scope: TokenScopeContext,
    ) -> (WorkerId, mpsc::UnboundedReceiver<HubMessage>) {
        let worker_id = WorkerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let worker = ConnectedWorker {
            worker_id: worker_id.clone(),
            registration_id: format!("test-{}", worker_id),
            scope,
            capabilities,
            labels: HashMap::new(),
            metadata: serde_json::Value::Null,
            sender: tx,
            connected_at: now,
            last_heartbeat: now,
            current_task: None,
            pending_termination: false,
            latency_ema_ms: None,
        };
        self.workers.write().await.insert(worker_id.clone(), worker);
        (worker_id, rx)
    }

    #[cfg(test)]
    pub(crate) async fn set_last_heartbeat(&self, worker_id: &WorkerId, at: DateTime<Utc>) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.last_heartbeat = at;
        }
    }
}

// ============================================================================
// Frame plumbing
// ============================================================================

async fn read_frame(stream: &mut SplitStream<WebSocket>) -> Option<WorkerMessage> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => match WorkerMessage::from_json(&text) {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!("Dropping malformed worker frame: {}", e);
                    continue;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &HubMessage,
) -> Result<()> {
    let text = message.to_json()?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
