//! Database error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[source] std::io::Error),
}
