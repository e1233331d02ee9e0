//! Storage layer for the NFT event tracker.
//!
//! This module provides database operations for:
//! - Collections and the contract catalog
//! - Items (per-token metadata, price/listing projections, pipeline state)
//! - Holdings (ERC-1155 per-owner balances)
//! - Orders, order items and signer nonces
//! - Activity history (mints, transfers, listings, offers, sales)
//! - Tracker checkpoints and cached block headers (reorg detection)
//! - Trading volume and floor price history

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod activity;
pub mod blocks;
pub mod collections;
pub mod holdings;
pub mod items;
pub mod orders;
pub mod staking;
pub mod tracker_state;
pub mod types;
pub mod volume;

pub use types::*;

/// Database storage for the tracker.
///
/// Provides async access to SQLite with connection pooling. Cloning is
/// cheap; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// Creates the database file if missing. Call [`Storage::run_migrations`]
    /// before first use.
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a new storage instance backed by a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let database_url = format!("sqlite://{}", path.display());
        Self::new(&database_url).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let collection_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collections")
            .fetch_one(&self.pool)
            .await?;

        let item_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nft_items")
            .fetch_one(&self.pool)
            .await?;

        let order_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;

        let activity_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activity_history")
            .fetch_one(&self.pool)
            .await?;

        let block_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?;

        Ok(DatabaseStats {
            collection_count: collection_count as u64,
            item_count: item_count as u64,
            order_count: order_count as u64,
            activity_count: activity_count as u64,
            block_count: block_count as u64,
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of collections
    pub collection_count: u64,

    /// Total number of NFT items
    pub item_count: u64,

    /// Total number of stored orders
    pub order_count: u64,

    /// Total number of activity entries
    pub activity_count: u64,

    /// Total number of cached blocks
    pub block_count: u64,
}

#[cfg(test)]
pub(crate) async fn test_storage() -> (Storage, tempfile::NamedTempFile) {
    let temp_db = tempfile::NamedTempFile::new().unwrap();
    let storage = Storage::new_with_path(temp_db.path()).await.unwrap();
    storage.run_migrations().await.unwrap();
    (storage, temp_db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_creation() {
        let (storage, _temp_db) = test_storage().await;

        storage.health_check().await.unwrap();

        storage.close().await;
    }

    #[tokio::test]
    async fn test_database_stats() {
        let (storage, _temp_db) = test_storage().await;

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.collection_count, 0);
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.order_count, 0);
        assert_eq!(stats.activity_count, 0);
        assert_eq!(stats.block_count, 0);

        storage.close().await;
    }
}
