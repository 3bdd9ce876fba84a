//! Database layer for the Engram backend.
//!
//! SQLite via sqlx with concrete pool types, which keeps full support for
//! `#[derive(FromRow)]` with custom enums and DateTime columns. The backend
//! is the single writer; WAL mode lets hook ingestion and the dispatcher
//! read concurrently.

mod error;
mod schema;

pub use error::DbError;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database pool type alias used across the backend.
pub type DbPool = SqlitePool;

/// Handle to the Engram database.
#[derive(Debug, Clone)]
pub struct EngramDb {
    pool: SqlitePool,
}

impl EngramDb {
    /// Open (creating if needed) a file-backed database and ensure schema.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(DbError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        info!("Opened database at {}", path.display());
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = EngramDb::open_memory().await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'engram_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        assert!(tables.contains(&"engram_tasks".to_string()));
        assert!(tables.contains(&"engram_sessions".to_string()));
        assert!(tables.contains(&"engram_worker_tokens".to_string()));
        assert!(tables.contains(&"engram_worker_registrations".to_string()));
        assert!(tables.contains(&"engram_hubs".to_string()));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = EngramDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        db.ensure_schema().await.unwrap();
    }
}
