//! Database connection pool

use crate::{DbError, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct DbPool(SqlitePool);

impl DbPool {
    /// Connect to database and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 8).await
    }

    /// Create an in-memory database for testing. A single connection: each
    /// sqlite memory connection is its own database, so a pool of them
    /// would not share the migrated schema.
    pub async fn in_memory() -> Result<Self> {
        Self::connect_with("sqlite::memory:", 1).await
    }

    async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database: {}", url);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(DbError::Sqlx)?;

        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self(pool))
    }

    /// Get the inner pool
    pub fn inner(&self) -> &SqlitePool {
        &self.0
    }

    /// Close the pool
    pub async fn close(&self) {
        self.0.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_connection() {
        let pool = DbPool::in_memory().await.unwrap();
        assert!(!pool.inner().is_closed());
    }
}
