//! Worker token and registration storage.
//!
//! Plaintext tokens never touch this module: the service layer hashes
//! before insert and compares hashes on validation.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use engram_db::EngramDb;
use engram_protocol::http::TokenView;
use engram_protocol::{HubId, RegistrationStatus, TokenId, TokenScope, WorkerId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;

use super::models::{json_list, json_map, opt_ts, ts};

/// A worker token row. `token_hash` is `<salt_hex>$<sha256_hex>`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub id: TokenId,
    pub name: String,
    pub token_hash: String,
    pub token_prefix: String,
    pub scope: TokenScope,
    pub hub_id: Option<HubId>,
    pub project_filter: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn to_view(&self) -> TokenView {
        TokenView {
            id: self.id.clone(),
            name: self.name.clone(),
            token_prefix: self.token_prefix.clone(),
            scope: self.scope,
            hub_id: self.hub_id.clone(),
            project_filter: self.project_filter.clone(),
            capabilities: self.capabilities.clone(),
            labels: self.labels.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            last_used_at: self.last_used_at,
        }
    }
}

/// A concrete worker instance tied to a token.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub id: String,
    pub token_id: TokenId,
    pub system_id: String,
    pub worker_id: Option<WorkerId>,
    pub capabilities: Vec<String>,
    pub labels: HashMap<String, String>,
    pub metadata: serde_json::Value,
    pub status: RegistrationStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    db: EngramDb,
}

impl TokenStore {
    pub fn new(db: EngramDb) -> Self {
        Self { db }
    }

    pub async fn insert(&self, record: &TokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engram_worker_tokens
                (id, name, token_hash, token_prefix, scope, hub_id, project_filter,
                 capabilities, labels, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.name)
        .bind(&record.token_hash)
        .bind(&record.token_prefix)
        .bind(record.scope.as_str())
        .bind(record.hub_id.as_ref().map(|h| h.as_str().to_string()))
        .bind(&record.project_filter)
        .bind(
            record
                .capabilities
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&record.labels)?)
        .bind(record.created_at.to_rfc3339())
        .bind(record.expires_at.map(|at| at.to_rfc3339()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &TokenId) -> Result<Option<TokenRecord>> {
        let row = sqlx::query("SELECT * FROM engram_worker_tokens WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_token).transpose()
    }

    pub async fn list(&self) -> Result<Vec<TokenRecord>> {
        let rows = sqlx::query("SELECT * FROM engram_worker_tokens ORDER BY created_at DESC")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(row_to_token).collect()
    }

    /// Candidate tokens for a presented plaintext, narrowed by prefix so
    /// validation hashes a handful of rows at most.
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<TokenRecord>> {
        let rows = sqlx::query("SELECT * FROM engram_worker_tokens WHERE token_prefix = ?")
            .bind(prefix)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(row_to_token).collect()
    }

    /// Idempotent revocation; the first call sets `revoked_at`, later calls
    /// are no-ops.
    pub async fn revoke(&self, id: &TokenId) -> Result<bool> {
        let revoked = sqlx::query(
            "UPDATE engram_worker_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;
        if revoked {
            info!(token_id = %id, "Worker token revoked");
        }
        Ok(revoked)
    }

    pub async fn touch_last_used(&self, id: &TokenId) -> Result<()> {
        sqlx::query("UPDATE engram_worker_tokens SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Registrations
    // ========================================================================

    /// Upsert by `(token_id, system_id)` and transition to online. A worker
    /// process reconnecting keeps its registration row.
    pub async fn register_worker(
        &self,
        token_id: &TokenId,
        system_id: &str,
        worker_id: &WorkerId,
        capabilities: &[String],
        labels: &HashMap<String, String>,
        metadata: &serde_json::Value,
    ) -> Result<RegistrationRecord> {
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO engram_worker_registrations
                (id, token_id, system_id, worker_id, capabilities, labels, metadata,
                 status, connected_at, last_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'online', ?, ?)
            ON CONFLICT (token_id, system_id) DO UPDATE SET
                worker_id = excluded.worker_id,
                capabilities = excluded.capabilities,
                labels = excluded.labels,
                metadata = excluded.metadata,
                status = 'online',
                connected_at = excluded.connected_at,
                disconnected_at = NULL,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&id)
        .bind(token_id.as_str())
        .bind(system_id)
        .bind(worker_id.as_str())
        .bind(serde_json::to_string(capabilities)?)
        .bind(serde_json::to_string(labels)?)
        .bind(serde_json::to_string(metadata)?)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        let row = sqlx::query(
            "SELECT * FROM engram_worker_registrations WHERE token_id = ? AND system_id = ?",
        )
        .bind(token_id.as_str())
        .bind(system_id)
        .fetch_one(self.db.pool())
        .await?;
        row_to_registration(&row)
    }

    pub async fn mark_offline(&self, registration_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_worker_registrations
            SET status = 'offline', disconnected_at = ?
            WHERE id = ? AND status = 'online'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(registration_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn heartbeat(&self, registration_id: &str) -> Result<()> {
        sqlx::query("UPDATE engram_worker_registrations SET last_heartbeat = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(registration_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn registrations_for_token(&self, token_id: &TokenId) -> Result<Vec<RegistrationRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM engram_worker_registrations WHERE token_id = ? ORDER BY connected_at DESC",
        )
        .bind(token_id.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_registration).collect()
    }
}

fn row_to_token(row: &SqliteRow) -> Result<TokenRecord> {
    let scope: String = row.try_get("scope")?;
    let labels: String = row.try_get("labels")?;
    let capabilities: Option<String> = row.try_get("capabilities")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(TokenRecord {
        id: TokenId::from_raw(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        token_hash: row.try_get("token_hash")?,
        token_prefix: row.try_get("token_prefix")?,
        scope: scope.parse().map_err(|e: String| anyhow!(e))?,
        hub_id: row.try_get::<Option<String>, _>("hub_id")?.map(HubId::new),
        project_filter: row.try_get("project_filter")?,
        capabilities: capabilities.as_deref().map(json_list).transpose()?,
        labels: json_map(&labels)?,
        created_at: ts(&created_at)?,
        expires_at: opt_ts(row.try_get("expires_at")?)?,
        revoked_at: opt_ts(row.try_get("revoked_at")?)?,
        last_used_at: opt_ts(row.try_get("last_used_at")?)?,
    })
}

fn row_to_registration(row: &SqliteRow) -> Result<RegistrationRecord> {
    let status: String = row.try_get("status")?;
    let capabilities: String = row.try_get("capabilities")?;
    let labels: String = row.try_get("labels")?;
    let metadata: String = row.try_get("metadata")?;
    let connected_at: String = row.try_get("connected_at")?;
    let last_heartbeat: String = row.try_get("last_heartbeat")?;

    Ok(RegistrationRecord {
        id: row.try_get("id")?,
        token_id: TokenId::from_raw(row.try_get::<String, _>("token_id")?),
        system_id: row.try_get("system_id")?,
        worker_id: row
            .try_get::<Option<String>, _>("worker_id")?
            .map(WorkerId::from_raw),
        capabilities: json_list(&capabilities)?,
        labels: json_map(&labels)?,
        metadata: serde_json::from_str(&metadata)?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        connected_at: ts(&connected_at)?,
        disconnected_at: opt_ts(row.try_get("disconnected_at")?)?,
        last_heartbeat: ts(&last_heartbeat)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TokenStore {
        let db = EngramDb::open_memory().await.unwrap();
        TokenStore::new(db)
    }

    fn record(name: &str, prefix: &str) -> TokenRecord {
        TokenRecord {
            id: TokenId::new(),
            name: name.to_string(),
            token_hash: "salt$digest".to_string(),
            token_prefix: prefix.to_string(),
            scope: TokenScope::Instance,
            hub_id: None,
            project_filter: None,
            capabilities: None,
            labels: HashMap::new(),
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let store = store().await;
        let token = record("ci-workers", "egt_abcd");
        store.insert(&token).await.unwrap();

        let loaded = store.get(&token.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "ci-workers");
        assert_eq!(loaded.token_prefix, "egt_abcd");
        assert!(!loaded.is_revoked());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let store = store().await;
        let token = record("t", "egt_abcd");
        store.insert(&token).await.unwrap();

        assert!(store.revoke(&token.id).await.unwrap());
        assert!(!store.revoke(&token.id).await.unwrap());
        assert!(store.get(&token.id).await.unwrap().unwrap().is_revoked());
    }

    #[tokio::test]
    async fn test_register_worker_upserts_by_system_id() {
        let store = store().await;
        let token = record("t", "egt_abcd");
        store.insert(&token).await.unwrap();

        let w1 = WorkerId::new();
        let first = store
            .register_worker(
                &token.id,
                "host-1:100",
                &w1,
                &["observation:sdk".to_string()],
                &HashMap::new(),
                &serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(first.status, RegistrationStatus::Online);

        store.mark_offline(&first.id).await.unwrap();

        // Reconnect with the same system id keeps the registration row.
        let w2 = WorkerId::new();
        let second = store
            .register_worker(
                &token.id,
                "host-1:100",
                &w2,
                &["observation:sdk".to_string(), "summarize:local".to_string()],
                &HashMap::new(),
                &serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, RegistrationStatus::Online);
        assert_eq!(second.worker_id, Some(w2));
        assert_eq!(second.capabilities.len(), 2);
        assert!(second.disconnected_at.is_none());

        let all = store.registrations_for_token(&token.id).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
