//! Dispatcher loop: keeps workers saturated and retries honoured.
//!
//! Wakes on task enqueue, worker idle/join, and retry timers; coalesces
//! bursts; then pumps claim -> route -> assign until no progress is made.
//! Each iteration is independent; the only synchronization is the
//! row-level atomicity of the queue's claim.

use anyhow::Result;
use chrono::Utc;
use engram_protocol::defaults::DISPATCH_COALESCE_WINDOW;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use crate::db::queue::TaskQueue;
use crate::federation::FederationClient;
use crate::hub::{AssignOutcome, WorkerHub};
use crate::router::FederatedRouter;

/// How many ready tasks one pump iteration walks. Keeps a head-of-line
/// task with no capable worker from starving the rest of the queue.
const PUMP_BATCH: i64 = 32;

/// Fallback wake interval when no retry timer is armed.
const IDLE_WAKE: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    queue: TaskQueue,
    router: FederatedRouter,
    hub: Arc<WorkerHub>,
    federation: Option<Arc<FederationClient>>,
    signal: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        queue: TaskQueue,
        router: FederatedRouter,
        hub: Arc<WorkerHub>,
        federation: Option<Arc<FederationClient>>,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            router,
            hub,
            federation,
            signal,
        }
    }

    /// Long-lived loop; exits when `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatcher started");
        loop {
            let wake_after = self.next_wake_delay().await;
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(wake_after) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            // Coalesce bursty enqueueing into one pump.
            tokio::time::sleep(DISPATCH_COALESCE_WINDOW).await;

            if let Err(e) = self.pump().await {
                error!("Dispatch pump failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }

    /// Time until the next armed retry, or the idle fallback.
    async fn next_wake_delay(&self) -> Duration {
        let now = Utc::now();
        match self.queue.next_retry_at(now).await {
            Ok(Some(at)) => (at - now).to_std().unwrap_or(Duration::ZERO),
            Ok(None) => IDLE_WAKE,
            Err(e) => {
                error!("Failed to read retry schedule: {}", e);
                IDLE_WAKE
            }
        }
    }

    /// Repeat claim -> route -> assign until a full pass makes no progress.
    pub async fn pump(&self) -> Result<usize> {
        let mut assigned_total = 0;
        loop {
            let batch = self.queue.next_ready_batch(Utc::now(), PUMP_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for task in &batch {
                let candidates = self.router.route(task).await?;
                for hub in &candidates {
                    let accepted = if hub.id.is_builtin() {
                        match self.hub.try_assign(task).await? {
                            AssignOutcome::Assigned(worker) => {
                                debug!(task_id = %task.id, worker_id = %worker, "Dispatched locally");
                                true
                            }
                            // Another claimer won; the task is no longer ours.
                            AssignOutcome::AlreadyClaimed => true,
                            AssignOutcome::NoCapableWorker => false,
                        }
                    } else if let Some(federation) = &self.federation {
                        federation.dispatch(hub, task).await.unwrap_or_else(|e| {
                            debug!(hub_id = %hub.id, "Federated dispatch failed: {}", e);
                            false
                        })
                    } else {
                        false
                    };

                    if accepted {
                        progressed = true;
                        assigned_total += 1;
                        break;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
        Ok(assigned_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::hubs::HubStore;
    use crate::db::queue::NewTask;
    use crate::db::tokens::TokenStore;
    use crate::events::EventBus;
    use crate::registry::HubRegistry;
    use crate::tokens::{TokenScopeContext, TokenService};
    use engram_db::EngramDb;
    use engram_protocol::{TaskStatus, TaskType, TokenId, TokenScope};

    async fn fixture() -> (Dispatcher, Arc<WorkerHub>, TaskQueue) {
        let db = EngramDb::open_memory().await.unwrap();
        let bus = EventBus::new();
        let signal = Arc::new(Notify::new());
        let queue = TaskQueue::new(db.clone(), bus.clone());
        let tokens = TokenService::new(TokenStore::new(db.clone()));
        let hub = Arc::new(WorkerHub::new(
            queue.clone(),
            tokens,
            bus,
            Arc::clone(&signal),
        ));
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();
        let router = FederatedRouter::new(registry);
        let dispatcher = Dispatcher::new(
            queue.clone(),
            router,
            Arc::clone(&hub),
            None,
            signal,
        );
        (dispatcher, hub, queue)
    }

    fn instance_scope() -> TokenScopeContext {
        TokenScopeContext {
            token_id: TokenId::new(),
            scope: TokenScope::Instance,
            hub_id: None,
            project_filter: None,
        }
    }

    fn observation(priority: i64) -> NewTask {
        NewTask::new(
            TaskType::Observation,
            "observation:sdk",
            serde_json::json!({"session_id": "s1", "project": "demo"}),
        )
        .priority(priority)
    }

    #[tokio::test]
    async fn test_pump_assigns_by_priority() {
        let (dispatcher, hub, queue) = fixture().await;
        let (worker_id, _rx) = hub
            .attach_for_test(vec!["observation:sdk".to_string()], instance_scope())
            .await;

        let (low, _) = queue.enqueue(observation(0)).await.unwrap();
        let (high, _) = queue.enqueue(observation(10)).await.unwrap();

        // One idle worker: exactly one task leaves pending, the higher
        // priority one.
        let assigned = dispatcher.pump().await.unwrap();
        assert_eq!(assigned, 1);
        let high_record = queue.get(&high).await.unwrap().unwrap();
        assert_eq!(high_record.status, TaskStatus::Assigned);
        assert_eq!(high_record.assigned_worker_id, Some(worker_id.clone()));
        assert_eq!(
            queue.get(&low).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        // Worker completes; the next pump drains the low-priority task.
        hub.handle_message(
            &worker_id,
            engram_protocol::WorkerMessage::TaskComplete(engram_protocol::TaskResultReport {
                task_id: high,
                result: serde_json::json!({}),
                trace: None,
            }),
        )
        .await
        .unwrap();

        let assigned = dispatcher.pump().await.unwrap();
        assert_eq!(assigned, 1);
        assert_eq!(
            queue.get(&low).await.unwrap().unwrap().status,
            TaskStatus::Assigned
        );
    }

    #[tokio::test]
    async fn test_pump_without_workers_makes_no_progress() {
        let (dispatcher, _hub, queue) = fixture().await;
        let (task, _) = queue.enqueue(observation(0)).await.unwrap();

        let assigned = dispatcher.pump().await.unwrap();
        assert_eq!(assigned, 0);
        assert_eq!(
            queue.get(&task).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_pump_drains_multiple_workers() {
        let (dispatcher, hub, queue) = fixture().await;
        hub.attach_for_test(vec!["observation:sdk".to_string()], instance_scope())
            .await;
        hub.attach_for_test(vec!["observation:sdk".to_string()], instance_scope())
            .await;

        for _ in 0..3 {
            queue.enqueue(observation(0)).await.unwrap();
        }

        // Two workers: two tasks assigned, one left pending.
        let assigned = dispatcher.pump().await.unwrap();
        assert_eq!(assigned, 2);
        let stats = queue.count_by_status().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.assigned, 2);
    }
}
