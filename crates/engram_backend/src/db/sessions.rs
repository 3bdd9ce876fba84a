//! Session storage.
//!
//! Sessions are created on the first ingested user prompt and mutated as
//! hook events arrive. The stale reaper completes sessions whose last
//! observed activity is older than the configured inactivity window.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use engram_db::EngramDb;
use engram_protocol::http::{DomainEvent, SessionInitRequest};
use engram_protocol::{SessionId, SessionStatus};
use tracing::{debug, info};

use super::models::{row_to_session, SessionRecord};
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct SessionStore {
    db: EngramDb,
    bus: EventBus,
}

impl SessionStore {
    pub fn new(db: EngramDb, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Create a session for an editor content-session id, or return the
    /// existing one. `content_session_id` is unique across all sessions.
    pub async fn init_session(&self, req: &SessionInitRequest) -> Result<(SessionId, bool)> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO engram_sessions
                (id, content_session_id, memory_session_id, project, status, started_at,
                 prompt_counter, git_repo, git_branch, cwd, is_worktree, plan_mode,
                 last_activity_at)
            VALUES (?, ?, ?, ?, 'active', ?, 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(&req.content_session_id)
        .bind(&req.memory_session_id)
        .bind(&req.project)
        .bind(&now)
        .bind(&req.git_repo)
        .bind(&req.git_branch)
        .bind(&req.cwd)
        .bind(req.is_worktree as i64)
        .bind(req.plan_mode as i64)
        .bind(&now)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing: String =
                sqlx::query_scalar("SELECT id FROM engram_sessions WHERE content_session_id = ?")
                    .bind(&req.content_session_id)
                    .fetch_one(self.db.pool())
                    .await?;
            debug!("Session already known for content id {}", req.content_session_id);
            return Ok((SessionId::from_raw(existing), false));
        }

        info!(session_id = %id, project = %req.project, "Session started");
        self.bus.emit(DomainEvent::SessionStarted {
            session_id: id.clone(),
            project: req.project.clone(),
        });
        Ok((id, true))
    }

    pub async fn get_by_content_id(&self, content_session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM engram_sessions WHERE content_session_id = ?")
            .bind(content_session_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    /// Bump the prompt counter and activity timestamp.
    pub async fn record_prompt(&self, content_session_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_sessions
            SET prompt_counter = prompt_counter + 1, last_activity_at = ?
            WHERE content_session_id = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(content_session_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Refresh activity without touching the prompt counter (tool events,
    /// summaries).
    pub async fn record_activity(&self, content_session_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE engram_sessions
            SET last_activity_at = ?
            WHERE content_session_id = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(content_session_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Explicit completion from the stop hook.
    pub async fn complete(
        &self,
        content_session_id: &str,
        status: SessionStatus,
    ) -> Result<bool> {
        let row: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE engram_sessions
            SET status = ?, completed_at = ?
            WHERE content_session_id = ? AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(content_session_id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(id) = row {
            info!(session_id = %id, status = %status, "Session completed");
            self.bus.emit(DomainEvent::SessionCompleted {
                session_id: SessionId::from_raw(id),
                status,
            });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The "current" session for a project: most recently started active.
    pub async fn current_for_project(&self, project: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM engram_sessions
            WHERE project = ? AND status = 'active'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(project)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    /// Complete sessions idle longer than `stale_after`. Returns how many
    /// were completed.
    pub async fn complete_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: std::time::Duration,
    ) -> Result<usize> {
        let window =
            ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::hours(4));
        let cutoff = (now - window).to_rfc3339();

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE engram_sessions
            SET status = 'completed', completed_at = ?
            WHERE status = 'active' AND last_activity_at < ?
            RETURNING id
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(&cutoff)
        .fetch_all(self.db.pool())
        .await?;

        for id in &ids {
            info!(session_id = %id, "Stale session completed by reaper");
            self.bus.emit(DomainEvent::SessionCompleted {
                session_id: SessionId::from_raw(id.clone()),
                status: SessionStatus::Completed,
            });
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_request(content_id: &str, project: &str) -> SessionInitRequest {
        SessionInitRequest {
            content_session_id: content_id.to_string(),
            project: project.to_string(),
            memory_session_id: None,
            git_repo: None,
            git_branch: Some("main".to_string()),
            cwd: Some("/work/demo".to_string()),
            is_worktree: false,
            plan_mode: false,
        }
    }

    async fn store() -> SessionStore {
        let db = EngramDb::open_memory().await.unwrap();
        SessionStore::new(db, EventBus::new())
    }

    #[tokio::test]
    async fn test_init_is_idempotent_per_content_id() {
        let store = store().await;

        let (first, created) = store.init_session(&init_request("c-1", "demo")).await.unwrap();
        assert!(created);
        let (second, created) = store.init_session(&init_request("c-1", "demo")).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_prompt_counter_and_activity() {
        let store = store().await;
        store.init_session(&init_request("c-1", "demo")).await.unwrap();

        assert!(store.record_prompt("c-1").await.unwrap());
        assert!(store.record_prompt("c-1").await.unwrap());
        assert!(!store.record_prompt("c-unknown").await.unwrap());

        let session = store.get_by_content_id("c-1").await.unwrap().unwrap();
        assert_eq!(session.prompt_counter, 2);
    }

    #[tokio::test]
    async fn test_current_session_is_most_recent_active() {
        let store = store().await;
        store.init_session(&init_request("c-1", "demo")).await.unwrap();

        // Force distinct started_at ordering.
        sqlx::query("UPDATE engram_sessions SET started_at = '2026-01-01T00:00:00+00:00' WHERE content_session_id = 'c-1'")
            .execute(store.db.pool())
            .await
            .unwrap();
        store.init_session(&init_request("c-2", "demo")).await.unwrap();

        let current = store.current_for_project("demo").await.unwrap().unwrap();
        assert_eq!(current.content_session_id, "c-2");

        store.complete("c-2", SessionStatus::Completed).await.unwrap();
        let current = store.current_for_project("demo").await.unwrap().unwrap();
        assert_eq!(current.content_session_id, "c-1");
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let store = store().await;
        store.init_session(&init_request("c-1", "demo")).await.unwrap();

        assert!(store.complete("c-1", SessionStatus::Completed).await.unwrap());
        assert!(!store.complete("c-1", SessionStatus::Completed).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_reaper_completes_idle_sessions() {
        let store = store().await;
        store.init_session(&init_request("c-1", "demo")).await.unwrap();
        store.init_session(&init_request("c-2", "demo")).await.unwrap();

        sqlx::query("UPDATE engram_sessions SET last_activity_at = '2026-01-01T00:00:00+00:00' WHERE content_session_id = 'c-1'")
            .execute(store.db.pool())
            .await
            .unwrap();

        let completed = store
            .complete_stale(Utc::now(), std::time::Duration::from_secs(4 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(completed, 1);

        let stale = store.get_by_content_id("c-1").await.unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Completed);
        let live = store.get_by_content_id("c-2").await.unwrap().unwrap();
        assert_eq!(live.status, SessionStatus::Active);
    }
}
