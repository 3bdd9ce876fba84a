//! Hub registry service.
//!
//! Tracks the builtin hub plus registered external hubs, their routing
//! attributes, and aggregated health. The builtin hub's health is derived
//! from the local worker hub's telemetry; external hubs push theirs.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use engram_protocol::http::{HubHealthReport, RegisterHubRequest};
use engram_protocol::{HubId, HubStatus};
use tracing::{debug, info};

use crate::db::hubs::HubStore;
use crate::db::models::HubRecord;

/// Average heartbeat latency above which the local hub reports degraded.
const DEGRADED_LATENCY_MS: f64 = 1000.0;
/// External hubs silent for this long are flipped offline.
const EXTERNAL_HEARTBEAT_GRACE_SECS: i64 = 120;

/// Snapshot of the local worker hub used to derive builtin-hub health.
#[derive(Debug, Clone, Default)]
pub struct LocalHubTelemetry {
    pub connected_workers: i64,
    pub active_workers: i64,
    pub avg_latency_ms: Option<f64>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HubRegistry {
    store: HubStore,
}

impl HubRegistry {
    pub fn new(store: HubStore) -> Self {
        Self { store }
    }

    /// Seed the builtin hub row. Called once at startup.
    pub async fn initialize(&self) -> Result<HubRecord> {
        let builtin = self.store.ensure_builtin().await?;
        info!(hub_id = %builtin.id, "Hub registry initialized");
        Ok(builtin)
    }

    pub async fn register_hub(&self, req: &RegisterHubRequest) -> Result<HubRecord> {
        self.store.register_external(req).await
    }

    pub async fn update_hub(&self, id: &HubId, req: &RegisterHubRequest) -> Result<bool> {
        self.store.update_external(id, req).await
    }

    /// Remove an external hub; removing the builtin hub fails.
    pub async fn remove_hub(&self, id: &HubId) -> Result<bool> {
        self.store.remove(id).await
    }

    pub async fn get_hub(&self, id: &HubId) -> Result<Option<HubRecord>> {
        self.store.get(id).await
    }

    pub async fn list_hubs(&self) -> Result<Vec<HubRecord>> {
        self.store.list().await
    }

    pub async fn healthy_hubs(&self, capability: Option<&str>) -> Result<Vec<HubRecord>> {
        self.store.healthy_hubs(capability).await
    }

    /// Apply a pushed health report from an external hub.
    pub async fn update_health(&self, report: &HubHealthReport) -> Result<bool> {
        debug!(hub_id = %report.hub_id, status = %report.status, "Hub health updated");
        self.store.update_health(report).await
    }

    /// Recompute and persist the builtin hub's health from local telemetry.
    /// `demanded_capabilities` is what the pending queue currently asks
    /// for; a demanded capability no worker covers degrades the hub.
    pub async fn publish_local_health(
        &self,
        telemetry: &LocalHubTelemetry,
        demanded_capabilities: &[String],
    ) -> Result<()> {
        let status = derive_local_status(telemetry, demanded_capabilities);
        let report = HubHealthReport {
            hub_id: HubId::builtin(),
            status,
            connected_workers: telemetry.connected_workers,
            active_workers: telemetry.active_workers,
            avg_latency_ms: telemetry.avg_latency_ms,
            capabilities: if telemetry.capabilities.is_empty() {
                None
            } else {
                Some(telemetry.capabilities.clone())
            },
        };
        self.store.update_health(&report).await?;
        Ok(())
    }

    /// Flip silent external hubs offline. Returns how many changed.
    pub async fn expire_silent_hubs(&self) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::seconds(EXTERNAL_HEARTBEAT_GRACE_SECS);
        self.store.mark_silent_external_offline(cutoff).await
    }

    /// Explicit shutdown is the only path to `offline` for the builtin hub.
    pub async fn mark_local_offline(&self) -> Result<()> {
        self.store.set_status(&HubId::builtin(), HubStatus::Offline).await
    }
}

/// Health derivation for the local hub: unhealthy with no reachable
/// workers; degraded when latency is high or a demanded capability has no
/// worker covering it; healthy otherwise.
fn derive_local_status(telemetry: &LocalHubTelemetry, demanded: &[String]) -> HubStatus {
    if telemetry.connected_workers == 0 {
        return HubStatus::Unhealthy;
    }
    if let Some(latency) = telemetry.avg_latency_ms {
        if latency > DEGRADED_LATENCY_MS {
            return HubStatus::Degraded;
        }
    }
    let uncovered = demanded
        .iter()
        .any(|cap| !telemetry.capabilities.iter().any(|have| have == cap));
    if uncovered {
        return HubStatus::Degraded;
    }
    HubStatus::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_db::EngramDb;

    async fn registry() -> HubRegistry {
        let db = EngramDb::open_memory().await.unwrap();
        let registry = HubRegistry::new(HubStore::new(db));
        registry.initialize().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_local_health_derivation() {
        assert_eq!(
            derive_local_status(&LocalHubTelemetry::default(), &[]),
            HubStatus::Unhealthy
        );
        assert_eq!(
            derive_local_status(
                &LocalHubTelemetry {
                    connected_workers: 2,
                    avg_latency_ms: Some(40.0),
                    ..Default::default()
                },
                &[]
            ),
            HubStatus::Healthy
        );
        assert_eq!(
            derive_local_status(
                &LocalHubTelemetry {
                    connected_workers: 2,
                    avg_latency_ms: Some(2500.0),
                    ..Default::default()
                },
                &[]
            ),
            HubStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_demanded_capability_gap_degrades() {
        let telemetry = LocalHubTelemetry {
            connected_workers: 2,
            avg_latency_ms: Some(30.0),
            capabilities: vec!["observation:sdk".to_string()],
            ..Default::default()
        };

        assert_eq!(
            derive_local_status(&telemetry, &["observation:sdk".to_string()]),
            HubStatus::Healthy
        );
        // Pending work demands a capability no connected worker declares.
        assert_eq!(
            derive_local_status(&telemetry, &["summarize:mistral".to_string()]),
            HubStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_publish_local_health_updates_builtin_row() {
        let registry = registry().await;
        registry
            .publish_local_health(
                &LocalHubTelemetry {
                    connected_workers: 3,
                    active_workers: 1,
                    avg_latency_ms: Some(25.0),
                    capabilities: vec!["observation:sdk".to_string()],
                },
                &[],
            )
            .await
            .unwrap();

        let builtin = registry.get_hub(&HubId::builtin()).await.unwrap().unwrap();
        assert_eq!(builtin.status, HubStatus::Healthy);
        assert_eq!(builtin.connected_workers, 3);
        assert_eq!(
            builtin.capabilities,
            Some(vec!["observation:sdk".to_string()])
        );
    }

    #[tokio::test]
    async fn test_remove_builtin_reports_failure() {
        let registry = registry().await;
        assert!(registry.remove_hub(&HubId::builtin()).await.is_err());
        assert!(registry.get_hub(&HubId::builtin()).await.unwrap().is_some());
    }
}
