//! Database schema creation for all Engram tables.
//!
//! All CREATE TABLE statements live here - single source of truth.
//! Timestamps are stored as RFC 3339 TEXT; JSON columns hold serde output.

use crate::{DbError, EngramDb};
use tracing::info;

impl EngramDb {
    /// Ensure all tables and indexes exist.
    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;

        self.create_session_tables().await?;
        self.create_task_tables().await?;
        self.create_worker_tables().await?;
        self.create_hub_tables().await?;

        info!("Database schema verified");
        Ok(())
    }

    async fn create_session_tables(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engram_sessions (
                id TEXT PRIMARY KEY,
                content_session_id TEXT NOT NULL UNIQUE,
                memory_session_id TEXT,
                project TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active','completed','failed')),
                started_at TEXT NOT NULL,
                completed_at TEXT,
                prompt_counter INTEGER NOT NULL DEFAULT 0 CHECK (prompt_counter >= 0),
                git_repo TEXT,
                git_branch TEXT,
                cwd TEXT,
                is_worktree INTEGER NOT NULL DEFAULT 0,
                plan_mode INTEGER NOT NULL DEFAULT 0,
                last_activity_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_sessions_content
             ON engram_sessions(content_session_id)",
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_sessions_project_status
             ON engram_sessions(project, status, started_at DESC)",
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_sessions_activity
             ON engram_sessions(status, last_activity_at)",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn create_task_tables(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engram_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending','assigned','processing','completed','failed','timeout')),
                required_capability TEXT NOT NULL,
                fallback_capabilities TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                result TEXT,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                assigned_worker_id TEXT,
                created_at TEXT NOT NULL,
                assigned_at TEXT,
                completed_at TEXT,
                retry_after TEXT,
                dedup_key TEXT,
                trace TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_tasks_claim
             ON engram_tasks(required_capability, status, priority DESC)",
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_tasks_retry
             ON engram_tasks(status, retry_after)",
        )
        .execute(self.pool())
        .await?;
        // Dedup uniqueness holds only across non-terminal rows.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_tasks_dedup_live
             ON engram_tasks(dedup_key)
             WHERE dedup_key IS NOT NULL
               AND status IN ('pending','assigned','processing')",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn create_worker_tables(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engram_worker_tokens (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                token_prefix TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT 'instance'
                    CHECK (scope IN ('instance','group','project')),
                hub_id TEXT,
                project_filter TEXT,
                capabilities TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked_at TEXT,
                last_used_at TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engram_worker_registrations (
                id TEXT PRIMARY KEY,
                token_id TEXT NOT NULL REFERENCES engram_worker_tokens(id),
                system_id TEXT NOT NULL,
                worker_id TEXT,
                capabilities TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT 'null',
                status TEXT NOT NULL DEFAULT 'offline'
                    CHECK (status IN ('online','offline')),
                connected_at TEXT NOT NULL,
                disconnected_at TEXT,
                last_heartbeat TEXT NOT NULL,
                UNIQUE (token_id, system_id)
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn create_hub_tables(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engram_hubs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hub_type TEXT NOT NULL CHECK (hub_type IN ('builtin','external')),
                endpoint TEXT,
                priority INTEGER NOT NULL DEFAULT 50 CHECK (priority BETWEEN 0 AND 100),
                weight INTEGER NOT NULL DEFAULT 50 CHECK (weight BETWEEN 0 AND 100),
                region TEXT,
                labels TEXT NOT NULL DEFAULT '{}',
                capabilities TEXT,
                status TEXT NOT NULL DEFAULT 'healthy'
                    CHECK (status IN ('healthy','degraded','unhealthy','offline')),
                connected_workers INTEGER NOT NULL DEFAULT 0,
                active_workers INTEGER NOT NULL DEFAULT 0,
                avg_latency_ms REAL,
                last_heartbeat TEXT,
                CHECK (hub_type = 'builtin' OR endpoint IS NOT NULL)
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_hubs_routing
             ON engram_hubs(status, priority DESC)",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
