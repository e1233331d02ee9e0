//! Tracker checkpoint storage operations.

use super::{Storage, TrackerState};
use anyhow::{Context, Result};
use sqlx::Row;

impl Storage {
    /// Fetch one tracker checkpoint.
    pub async fn get_tracker_state(&self, tag: &str) -> Result<Option<TrackerState>> {
        let row = sqlx::query(
            "SELECT tag, last_block_processed FROM tracker_states WHERE tag = ?",
        )
        .bind(tag)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TrackerState {
            tag: row.get("tag"),
            last_block_processed: row.get::<i64, _>("last_block_processed") as u64,
        }))
    }

    /// Write a tracker checkpoint.
    ///
    /// The checkpoint is the last fully processed block; the tracker resumes
    /// at the block after it.
    pub async fn upsert_tracker_state(&self, tag: &str, last_block_processed: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracker_states (tag, last_block_processed)
            VALUES (?, ?)
            ON CONFLICT(tag) DO UPDATE SET
                last_block_processed = excluded.last_block_processed
            "#,
        )
        .bind(tag)
        .bind(last_block_processed as i64)
        .execute(&self.pool)
        .await
        .context("Failed to upsert tracker state")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let (storage, _temp_db) = test_storage().await;

        assert!(storage
            .get_tracker_state("1:0xabc:transfers")
            .await
            .unwrap()
            .is_none());

        storage
            .upsert_tracker_state("1:0xabc:transfers", 100)
            .await
            .unwrap();
        storage
            .upsert_tracker_state("1:0xabc:transfers", 150)
            .await
            .unwrap();

        let state = storage
            .get_tracker_state("1:0xabc:transfers")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_block_processed, 150);
    }

    #[tokio::test]
    async fn test_rewind_can_lower_checkpoint() {
        let (storage, _temp_db) = test_storage().await;

        storage.upsert_tracker_state("t", 150).await.unwrap();
        storage.upsert_tracker_state("t", 120).await.unwrap();

        let state = storage.get_tracker_state("t").await.unwrap().unwrap();
        assert_eq!(state.last_block_processed, 120);
    }
}
