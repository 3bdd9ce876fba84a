//! Federated router: picks target hubs for a task.
//!
//! Routing is advisory. The router produces an ordered candidate list;
//! whoever consumes it (the dispatcher) walks the list until a hub
//! actually accepts the assignment. The builtin hub has fixed priority
//! 100 and is always the final fallback.

use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

use crate::db::models::{HubRecord, TaskRecord};
use crate::registry::HubRegistry;

#[derive(Debug, Clone)]
pub struct FederatedRouter {
    registry: HubRegistry,
}

impl FederatedRouter {
    pub fn new(registry: HubRegistry) -> Self {
        Self { registry }
    }

    /// Ordered hub candidates for `task`: filtered by health, capability,
    /// region and labels; grouped by priority descending; weighted-random
    /// order within each group.
    pub async fn route(&self, task: &TaskRecord) -> Result<Vec<HubRecord>> {
        let hubs = self.registry.healthy_hubs(Some(&task.required_capability)).await?;
        let mut candidates = apply_task_filters(hubs, task);

        let mut ordered = Vec::with_capacity(candidates.len());
        {
            let mut rng = rand::thread_rng();
            while !candidates.is_empty() {
                let top_priority = candidates.iter().map(|h| h.priority).max().unwrap_or(0);
                let mut group: Vec<HubRecord> = Vec::new();
                candidates.retain(|hub| {
                    if hub.priority == top_priority {
                        group.push(hub.clone());
                        false
                    } else {
                        true
                    }
                });
                ordered.extend(weighted_order(group, &mut rng));
            }
        }

        // Region/label filters can exclude the builtin hub; it still backs
        // every route as the last resort.
        if !ordered.iter().any(|hub| hub.id.is_builtin()) {
            if let Some(builtin) = self
                .registry
                .list_hubs()
                .await?
                .into_iter()
                .find(|hub| hub.id.is_builtin())
            {
                ordered.push(builtin);
            }
        }

        debug!(
            task_id = %task.id,
            candidates = ordered.len(),
            "Routed task"
        );
        Ok(ordered)
    }
}

fn apply_task_filters(hubs: Vec<HubRecord>, task: &TaskRecord) -> Vec<HubRecord> {
    let region = task.region();
    let labels = routing_labels(task);

    hubs.into_iter()
        .filter(|hub| match region {
            Some(region) => hub.region.as_deref() == Some(region),
            None => true,
        })
        .filter(|hub| labels.iter().all(|(k, v)| hub.labels.get(k) == Some(v)))
        .collect()
}

/// Optional label constraints carried in the payload.
fn routing_labels(task: &TaskRecord) -> HashMap<String, String> {
    task.payload
        .get("routing_labels")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Order one priority group by repeated weighted sampling without
/// replacement. Zero-weight hubs sort last in arbitrary order.
fn weighted_order<R: Rng>(mut group: Vec<HubRecord>, rng: &mut R) -> Vec<HubRecord> {
    let mut ordered = Vec::with_capacity(group.len());
    while !group.is_empty() {
        let total: i64 = group.iter().map(|h| h.weight.max(0)).sum();
        let index = if total == 0 {
            0
        } else {
            let mut roll = rng.gen_range(0..total);
            let mut chosen = 0;
            for (i, hub) in group.iter().enumerate() {
                let weight = hub.weight.max(0);
                if roll < weight {
                    chosen = i;
                    break;
                }
                roll -= weight;
            }
            chosen
        };
        ordered.push(group.remove(index));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::hubs::HubStore;
    use chrono::Utc;
    use engram_db::EngramDb;
    use engram_protocol::http::{HubHealthReport, RegisterHubRequest};
    use engram_protocol::{HubStatus, TaskId, TaskStatus, TaskType};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn task(payload: serde_json::Value) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(),
            task_type: TaskType::Observation,
            status: TaskStatus::Pending,
            required_capability: "observation:sdk".to_string(),
            fallback_capabilities: vec![],
            priority: 0,
            payload,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            assigned_worker_id: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            retry_after: None,
            dedup_key: None,
            trace: None,
        }
    }

    fn hub_record(name: &str, priority: i64, weight: i64, region: Option<&str>) -> HubRecord {
        HubRecord {
            id: engram_protocol::HubId::new(format!("hub-{}", name)),
            name: name.to_string(),
            hub_type: engram_protocol::HubType::External,
            endpoint: Some(format!("ws://{}.example/ws/worker", name)),
            priority,
            weight,
            region: region.map(str::to_string),
            labels: HashMap::new(),
            capabilities: None,
            status: HubStatus::Healthy,
            connected_workers: 1,
            active_workers: 0,
            avg_latency_ms: None,
            last_heartbeat: None,
        }
    }

    async fn registry_with_external(priority: i64, region: Option<&str>) -> HubRegistry {
        let db = EngramDb::open_memory().await.unwrap();
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();
        let hub = registry
            .register_hub(&RegisterHubRequest {
                name: "external".to_string(),
                endpoint: "ws://external.example/ws/worker".to_string(),
                priority,
                weight: 50,
                region: region.map(str::to_string),
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        registry
            .update_health(&HubHealthReport {
                hub_id: hub.id,
                status: HubStatus::Healthy,
                connected_workers: 1,
                active_workers: 0,
                avg_latency_ms: None,
                capabilities: None,
            })
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_builtin_wins_on_priority() {
        let registry = registry_with_external(40, None).await;
        let router = FederatedRouter::new(registry);

        let route = router.route(&task(serde_json::json!({}))).await.unwrap();
        assert_eq!(route.len(), 2);
        // Builtin has priority 100, above any external default.
        assert!(route[0].id.is_builtin());
    }

    #[tokio::test]
    async fn test_region_filter_keeps_builtin_fallback() {
        let registry = registry_with_external(60, Some("eu-west")).await;
        let router = FederatedRouter::new(registry);

        let route = router
            .route(&task(serde_json::json!({"region": "us-east"})))
            .await
            .unwrap();
        // Only the builtin fallback survives a non-matching region.
        assert_eq!(route.len(), 1);
        assert!(route[0].id.is_builtin());

        let route = router
            .route(&task(serde_json::json!({"region": "eu-west"})))
            .await
            .unwrap();
        assert_eq!(route.len(), 2);
        assert!(!route[0].id.is_builtin());
        assert!(route[1].id.is_builtin());
    }

    #[test]
    fn test_weighted_order_prefers_heavier_hub() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut heavy_first = 0;
        for _ in 0..200 {
            let group = vec![
                hub_record("heavy", 50, 90, None),
                hub_record("light", 50, 10, None),
            ];
            let ordered = weighted_order(group, &mut rng);
            if ordered[0].name == "heavy" {
                heavy_first += 1;
            }
        }
        // 90/10 weighting should dominate; leave slack for randomness.
        assert!(heavy_first > 140, "heavy hub first only {}/200 times", heavy_first);
    }

    #[test]
    fn test_label_filter_subset_match() {
        let mut labelled = hub_record("gpu", 50, 50, None);
        labelled.labels.insert("tier".to_string(), "gpu".to_string());
        let plain = hub_record("cpu", 50, 50, None);

        let task = task(serde_json::json!({"routing_labels": {"tier": "gpu"}}));
        let kept = apply_task_filters(vec![labelled.clone(), plain], &task);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "gpu");
    }
}
