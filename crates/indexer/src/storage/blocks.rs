//! Block header cache storage operations.

use super::{BlockRecord, Storage};
use alloy::primitives::B256;
use anyhow::{Context, Result};
use sqlx::Row;

impl Storage {
    /// Upsert a cached block header.
    ///
    /// Re-inserting the same height after a reorg replaces the hash.
    pub async fn upsert_block(&self, block: &BlockRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blocks (chain_id, number, hash, timestamp)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chain_id, number) DO UPDATE SET
                hash = excluded.hash,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(block.chain_id as i64)
        .bind(block.number as i64)
        .bind(block.hash.to_string())
        .bind(block.timestamp as i64)
        .execute(&self.pool)
        .await
        .context("Failed to upsert block")?;

        Ok(())
    }

    /// Fetch a cached block header by height.
    pub async fn get_block(&self, chain_id: u64, number: u64) -> Result<Option<BlockRecord>> {
        let row = sqlx::query(
            "SELECT chain_id, number, hash, timestamp FROM blocks WHERE chain_id = ? AND number = ?",
        )
        .bind(chain_id as i64)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let hash: String = row.get("hash");
            Ok(BlockRecord {
                chain_id: row.get::<i64, _>("chain_id") as u64,
                number: row.get::<i64, _>("number") as u64,
                hash: hash
                    .parse::<B256>()
                    .map_err(|e| anyhow::anyhow!("Invalid block hash in database: {e}"))?,
                timestamp: row.get::<i64, _>("timestamp") as u64,
            })
        })
        .transpose()
    }

    /// Drop cached headers at or above a height (rewind path).
    pub async fn delete_blocks_from(&self, chain_id: u64, number: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number >= ?")
            .bind(chain_id as i64)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Drop cached headers below a height (steady-state pruning).
    pub async fn prune_blocks_before(&self, chain_id: u64, number: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number < ?")
            .bind(chain_id as i64)
            .bind(number as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
