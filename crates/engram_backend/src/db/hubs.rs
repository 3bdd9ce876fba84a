//! Hub registry storage.
//!
//! One builtin hub row always exists and cannot be removed; external hubs
//! carry a WebSocket endpoint and report health via heartbeats.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use engram_db::EngramDb;
use engram_protocol::defaults::{BUILTIN_HUB_ID, BUILTIN_HUB_NAME, BUILTIN_HUB_PRIORITY};
use engram_protocol::http::{HubHealthReport, RegisterHubRequest};
use engram_protocol::{HubId, HubStatus, HubType};
use tracing::info;

use super::models::{row_to_hub, HubRecord};

#[derive(Debug, Clone)]
pub struct HubStore {
    db: EngramDb,
}

impl HubStore {
    pub fn new(db: EngramDb) -> Self {
        Self { db }
    }

    /// Ensure the builtin hub row exists and is marked healthy.
    pub async fn ensure_builtin(&self) -> Result<HubRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO engram_hubs
                (id, name, hub_type, priority, weight, labels, status, last_heartbeat)
            VALUES (?, ?, 'builtin', ?, 100, '{}', 'healthy', ?)
            ON CONFLICT (id) DO UPDATE SET
                status = 'healthy',
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(BUILTIN_HUB_ID)
        .bind(BUILTIN_HUB_NAME)
        .bind(BUILTIN_HUB_PRIORITY)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        let builtin = self
            .get(&HubId::builtin())
            .await?
            .expect("builtin hub row must exist after ensure");
        Ok(builtin)
    }

    pub async fn register_external(&self, req: &RegisterHubRequest) -> Result<HubRecord> {
        let id = HubId::generate();
        sqlx::query(
            r#"
            INSERT INTO engram_hubs
                (id, name, hub_type, endpoint, priority, weight, region, labels, status)
            VALUES (?, ?, 'external', ?, ?, ?, ?, ?, 'healthy')
            "#,
        )
        .bind(id.as_str())
        .bind(&req.name)
        .bind(&req.endpoint)
        .bind(req.priority.clamp(0, 100))
        .bind(req.weight.clamp(0, 100))
        .bind(&req.region)
        .bind(serde_json::to_string(&req.labels)?)
        .execute(self.db.pool())
        .await?;

        info!(hub_id = %id, name = %req.name, "External hub registered");
        Ok(self.get(&id).await?.expect("hub row just inserted"))
    }

    pub async fn update_external(&self, id: &HubId, req: &RegisterHubRequest) -> Result<bool> {
        if id.is_builtin() {
            bail!("The builtin hub cannot be updated");
        }
        let updated = sqlx::query(
            r#"
            UPDATE engram_hubs
            SET name = ?, endpoint = ?, priority = ?, weight = ?, region = ?, labels = ?
            WHERE id = ? AND hub_type = 'external'
            "#,
        )
        .bind(&req.name)
        .bind(&req.endpoint)
        .bind(req.priority.clamp(0, 100))
        .bind(req.weight.clamp(0, 100))
        .bind(&req.region)
        .bind(serde_json::to_string(&req.labels)?)
        .bind(id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Remove an external hub. Removing the builtin hub is refused.
    pub async fn remove(&self, id: &HubId) -> Result<bool> {
        if id.is_builtin() {
            bail!("The builtin hub cannot be removed");
        }
        let removed = sqlx::query("DELETE FROM engram_hubs WHERE id = ? AND hub_type = 'external'")
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(removed == 1)
    }

    pub async fn get(&self, id: &HubId) -> Result<Option<HubRecord>> {
        let row = sqlx::query("SELECT * FROM engram_hubs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_hub).transpose()
    }

    pub async fn list(&self) -> Result<Vec<HubRecord>> {
        let rows = sqlx::query("SELECT * FROM engram_hubs ORDER BY priority DESC, id ASC")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(row_to_hub).collect()
    }

    /// Apply a health heartbeat from a hub (external push or the local
    /// hub's own telemetry).
    pub async fn update_health(&self, report: &HubHealthReport) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_hubs
            SET status = ?, connected_workers = ?, active_workers = ?,
                avg_latency_ms = ?, capabilities = ?, last_heartbeat = ?
            WHERE id = ?
            "#,
        )
        .bind(report.status.as_str())
        .bind(report.connected_workers)
        .bind(report.active_workers)
        .bind(report.avg_latency_ms)
        .bind(
            report
                .capabilities
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(report.hub_id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn set_status(&self, id: &HubId, status: HubStatus) -> Result<()> {
        sqlx::query("UPDATE engram_hubs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Hubs eligible for routing, optionally filtered by capability.
    pub async fn healthy_hubs(&self, capability: Option<&str>) -> Result<Vec<HubRecord>> {
        let hubs = self.list().await?;
        Ok(hubs
            .into_iter()
            .filter(|hub| hub.status.is_routable())
            .filter(|hub| capability.map(|cap| hub.supports(cap)).unwrap_or(true))
            .collect())
    }

    pub async fn by_region(&self, region: &str) -> Result<Vec<HubRecord>> {
        let hubs = self.list().await?;
        Ok(hubs
            .into_iter()
            .filter(|hub| hub.region.as_deref() == Some(region))
            .collect())
    }

    /// Hubs whose labels contain every requested pair.
    pub async fn by_labels(
        &self,
        labels: &std::collections::HashMap<String, String>,
    ) -> Result<Vec<HubRecord>> {
        let hubs = self.list().await?;
        Ok(hubs
            .into_iter()
            .filter(|hub| labels.iter().all(|(k, v)| hub.labels.get(k) == Some(v)))
            .collect())
    }

    /// External hubs considered offline because their last heartbeat is
    /// older than `cutoff`.
    pub async fn mark_silent_external_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_hubs
            SET status = 'offline'
            WHERE hub_type = 'external'
              AND status != 'offline'
              AND (last_heartbeat IS NULL OR last_heartbeat < ?)
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn store() -> HubStore {
        let db = EngramDb::open_memory().await.unwrap();
        HubStore::new(db)
    }

    fn external(name: &str) -> RegisterHubRequest {
        RegisterHubRequest {
            name: name.to_string(),
            endpoint: format!("ws://{}.example:37840/ws/worker", name),
            priority: 60,
            weight: 50,
            region: Some("eu-west".to_string()),
            labels: HashMap::from([("tier".to_string(), "gpu".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_ensure_builtin_idempotent() {
        let store = store().await;
        let first = store.ensure_builtin().await.unwrap();
        let second = store.ensure_builtin().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.hub_type, HubType::Builtin);
        assert_eq!(first.priority, BUILTIN_HUB_PRIORITY);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_builtin_cannot_be_removed() {
        let store = store().await;
        store.ensure_builtin().await.unwrap();
        assert!(store.remove(&HubId::builtin()).await.is_err());
        assert!(store.get(&HubId::builtin()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_and_remove_external() {
        let store = store().await;
        let hub = store.register_external(&external("eu")).await.unwrap();
        assert_eq!(hub.hub_type, HubType::External);
        assert!(hub.endpoint.is_some());

        assert!(store.remove(&hub.id).await.unwrap());
        assert!(store.get(&hub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_healthy_hubs_capability_filter() {
        let store = store().await;
        store.ensure_builtin().await.unwrap();
        let hub = store.register_external(&external("eu")).await.unwrap();

        store
            .update_health(&HubHealthReport {
                hub_id: hub.id.clone(),
                status: HubStatus::Healthy,
                connected_workers: 2,
                active_workers: 1,
                avg_latency_ms: Some(12.0),
                capabilities: Some(vec!["summarize:mistral".to_string()]),
            })
            .await
            .unwrap();

        // Builtin has no declared capabilities: wildcard.
        let hubs = store.healthy_hubs(Some("observation:sdk")).await.unwrap();
        assert_eq!(hubs.len(), 1);
        assert!(hubs[0].id.is_builtin());

        let hubs = store.healthy_hubs(Some("summarize:mistral")).await.unwrap();
        assert_eq!(hubs.len(), 2);
    }

    #[tokio::test]
    async fn test_silent_external_hubs_go_offline() {
        let store = store().await;
        store.ensure_builtin().await.unwrap();
        store.register_external(&external("eu")).await.unwrap();

        // No heartbeat recorded yet; a future cutoff flips it offline.
        let flipped = store
            .mark_silent_external_offline(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(flipped, 1);

        let hubs = store.healthy_hubs(None).await.unwrap();
        assert_eq!(hubs.len(), 1);
        assert!(hubs[0].id.is_builtin());
    }

    #[tokio::test]
    async fn test_label_subset_match() {
        let store = store().await;
        store.register_external(&external("eu")).await.unwrap();

        let hit = store
            .by_labels(&HashMap::from([("tier".to_string(), "gpu".to_string())]))
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store
            .by_labels(&HashMap::from([("tier".to_string(), "cpu".to_string())]))
            .await
            .unwrap();
        assert!(miss.is_empty());
    }
}
