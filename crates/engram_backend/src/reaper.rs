//! Periodic maintenance: stale tasks, dead workers, idle sessions,
//! terminal-row cleanup, and local hub health publication.

use chrono::Utc;
use engram_protocol::defaults::{REAPER_INTERVAL, SESSION_STALE_AFTER};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

use crate::db::queue::TaskQueue;
use crate::db::sessions::SessionStore;
use crate::federation::FederationClient;
use crate::hub::WorkerHub;
use crate::registry::HubRegistry;

pub struct Reaper {
    queue: TaskQueue,
    sessions: SessionStore,
    hub: Arc<WorkerHub>,
    registry: HubRegistry,
    federation: Option<Arc<FederationClient>>,
    dispatch_signal: Arc<Notify>,
}

impl Reaper {
    pub fn new(
        queue: TaskQueue,
        sessions: SessionStore,
        hub: Arc<WorkerHub>,
        registry: HubRegistry,
        federation: Option<Arc<FederationClient>>,
        dispatch_signal: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            sessions,
            hub,
            registry,
            federation,
            dispatch_signal,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Reaper started (interval {:?})", REAPER_INTERVAL);
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.tick().await;
        }
        info!("Reaper stopped");
    }

    /// One maintenance pass. Failures in one step never block the rest.
    pub async fn tick(&self) {
        let now = Utc::now();

        let dead = self.hub.reap_dead_workers(now).await;
        if !dead.is_empty() {
            info!("Reaped {} dead workers", dead.len());
        }

        match self.queue.reap(now).await {
            Ok(0) => {}
            Ok(reaped) => {
                info!("Reaped {} stale tasks", reaped);
                self.dispatch_signal.notify_one();
            }
            Err(e) => error!("Task reap failed: {}", e),
        }

        match self.sessions.complete_stale(now, SESSION_STALE_AFTER).await {
            Ok(0) => {}
            Ok(completed) => info!("Completed {} stale sessions", completed),
            Err(e) => error!("Session reap failed: {}", e),
        }

        if let Err(e) = self.queue.cleanup(now).await {
            error!("Task cleanup failed: {}", e);
        }

        let telemetry = self.hub.telemetry().await;
        let demanded = match self.queue.pending_capabilities().await {
            Ok(demanded) => demanded,
            Err(e) => {
                error!("Failed to read pending capabilities: {}", e);
                Vec::new()
            }
        };
        if let Err(e) = self.registry.publish_local_health(&telemetry, &demanded).await {
            error!("Failed to publish local hub health: {}", e);
        }
        match self.registry.expire_silent_hubs().await {
            Ok(0) => {}
            Ok(expired) => debug!("Marked {} silent external hubs offline", expired),
            Err(e) => error!("Hub expiry failed: {}", e),
        }

        // Announce ourselves to federated hubs; a dead hub just logs.
        if let Some(federation) = &self.federation {
            if let Ok(Some(builtin)) = self.registry.get_hub(&engram_protocol::HubId::builtin()).await
            {
                let report = engram_protocol::http::HubHealthReport {
                    hub_id: builtin.id.clone(),
                    status: builtin.status,
                    connected_workers: builtin.connected_workers,
                    active_workers: builtin.active_workers,
                    avg_latency_ms: builtin.avg_latency_ms,
                    capabilities: builtin.capabilities.clone(),
                };
                match self.registry.list_hubs().await {
                    Ok(hubs) => {
                        for hub in hubs.iter().filter(|h| !h.id.is_builtin()) {
                            if let Err(e) = federation.push_health(hub, &report).await {
                                debug!(hub_id = %hub.id, "Health push failed: {}", e);
                            }
                        }
                    }
                    Err(e) => error!("Failed to list hubs for health push: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::hubs::HubStore;
    use crate::db::queue::NewTask;
    use crate::db::tokens::TokenStore;
    use crate::events::EventBus;
    use crate::tokens::{TokenScopeContext, TokenService};
    use engram_db::EngramDb;
    use engram_protocol::{HubId, HubStatus, TaskType, TokenId, TokenScope};

    #[tokio::test]
    async fn test_tick_publishes_unhealthy_without_workers() {
        let db = EngramDb::open_memory().await.unwrap();
        let bus = EventBus::new();
        let signal = Arc::new(Notify::new());
        let queue = TaskQueue::new(db.clone(), bus.clone());
        let sessions = SessionStore::new(db.clone(), bus.clone());
        let tokens = TokenService::new(TokenStore::new(db.clone()));
        let hub = Arc::new(WorkerHub::new(
            queue.clone(),
            tokens,
            bus,
            Arc::clone(&signal),
        ));
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();

        let reaper = Reaper::new(queue, sessions, Arc::clone(&hub), registry.clone(), None, signal);
        reaper.tick().await;

        let builtin = registry.get_hub(&HubId::builtin()).await.unwrap().unwrap();
        assert_eq!(builtin.status, HubStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_tick_degrades_on_uncovered_pending_capability() {
        let db = EngramDb::open_memory().await.unwrap();
        let bus = EventBus::new();
        let signal = Arc::new(Notify::new());
        let queue = TaskQueue::new(db.clone(), bus.clone());
        let sessions = SessionStore::new(db.clone(), bus.clone());
        let tokens = TokenService::new(TokenStore::new(db.clone()));
        let hub = Arc::new(WorkerHub::new(
            queue.clone(),
            tokens,
            bus,
            Arc::clone(&signal),
        ));
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();

        hub.attach_for_test(
            vec!["observation:sdk".to_string()],
            TokenScopeContext {
                token_id: TokenId::new(),
                scope: TokenScope::Instance,
                hub_id: None,
                project_filter: None,
            },
        )
        .await;

        // Pending work demands a capability the connected worker lacks.
        queue
            .enqueue(NewTask::new(
                TaskType::Summarize,
                "summarize:mistral",
                serde_json::json!({"project": "demo"}),
            ))
            .await
            .unwrap();

        let reaper = Reaper::new(
            queue,
            sessions,
            Arc::clone(&hub),
            registry.clone(),
            None,
            signal,
        );
        reaper.tick().await;

        let builtin = registry.get_hub(&HubId::builtin()).await.unwrap().unwrap();
        assert_eq!(builtin.status, HubStatus::Degraded);
    }

    #[tokio::test]
    async fn test_tick_reaps_dead_worker_and_requeues_task() {
        let db = EngramDb::open_memory().await.unwrap();
        let bus = EventBus::new();
        let signal = Arc::new(Notify::new());
        let queue = TaskQueue::new(db.clone(), bus.clone());
        let sessions = SessionStore::new(db.clone(), bus.clone());
        let tokens = TokenService::new(TokenStore::new(db.clone()));
        let hub = Arc::new(WorkerHub::new(
            queue.clone(),
            tokens,
            bus,
            Arc::clone(&signal),
        ));
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();

        let (worker_id, _rx) = hub
            .attach_for_test(
                vec!["observation:sdk".to_string()],
                TokenScopeContext {
                    token_id: TokenId::new(),
                    scope: TokenScope::Instance,
                    hub_id: None,
                    project_filter: None,
                },
            )
            .await;

        let (task_id, _) = queue
            .enqueue(NewTask::new(
                TaskType::Observation,
                "observation:sdk",
                serde_json::json!({"project": "demo"}),
            ))
            .await
            .unwrap();
        let task = queue.get(&task_id).await.unwrap().unwrap();
        hub.try_assign(&task).await.unwrap();

        hub.set_last_heartbeat(&worker_id, Utc::now() - chrono::Duration::minutes(5))
            .await;

        let reaper = Reaper::new(queue.clone(), sessions, Arc::clone(&hub), registry, None, signal);
        reaper.tick().await;

        let record = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(record.status, engram_protocol::TaskStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(hub.connected_count().await, 0);
    }
}
