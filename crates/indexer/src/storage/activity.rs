//! Activity history storage operations.

use super::{ActivityRecord, Storage};
use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address, ActivityKind};
use sqlx::Row;
use std::str::FromStr;

impl Storage {
    /// Insert an activity entry.
    ///
    /// Mint/transfer/sale entries carry a `(chain_id, tx_hash,
    /// log_index, token_id)` key and are dropped silently on
    /// re-delivery; returns `false` for such a duplicate.
    pub async fn insert_activity(&self, activity: &ActivityRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO activity_history (
                chain_id, collection, token_id, kind,
                account, to_account, quantity,
                price, price_in_usd, price_in_native,
                block_number, tx_hash, log_index, time, source
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(activity.chain_id as i64)
        .bind(lowercase_address(&activity.collection))
        .bind(activity.token_id.to_string())
        .bind(activity.kind.as_str())
        .bind(&activity.account)
        .bind(&activity.to_account)
        .bind(activity.quantity as i64)
        .bind(activity.price.to_string())
        .bind(activity.price_in_usd)
        .bind(activity.price_in_native)
        .bind(activity.block_number.map(|v| v as i64))
        .bind(activity.tx_hash.map(|h| h.to_string()))
        .bind(activity.log_index.map(|v| v as i64))
        .bind(activity.time)
        .bind(&activity.source)
        .execute(&self.pool)
        .await
        .context("Failed to insert activity")?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete chain-derived activity of a collection at or above a block.
    ///
    /// Used by the rewind path; off-chain entries (listings, offers,
    /// cancellations) have no block number and are untouched.
    pub async fn delete_chain_activity_from_block(
        &self,
        chain_id: u64,
        collection: &Address,
        from_block: u64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM activity_history
            WHERE chain_id = ? AND collection = ?
              AND block_number IS NOT NULL AND block_number >= ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(from_block as i64)
        .execute(&self.pool)
        .await
        .context("Failed to delete chain activity")?;

        Ok(result.rows_affected())
    }

    /// Mint/transfer entries of a collection at or above a block.
    ///
    /// The ERC-1155 rewind path reads these before dropping them so it
    /// can reverse the holdings deltas they carried.
    pub async fn list_chain_transfers_from_block(
        &self,
        chain_id: u64,
        collection: &Address,
        from_block: u64,
    ) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, collection, token_id, kind,
                   account, to_account, quantity,
                   price, price_in_usd, price_in_native,
                   block_number, tx_hash, log_index, time, source
            FROM activity_history
            WHERE chain_id = ? AND collection = ?
              AND kind IN ('mint', 'transfer')
              AND block_number IS NOT NULL AND block_number >= ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(from_block as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_activity).collect()
    }

    /// Delete on-chain sale and cancel activity at or above a block,
    /// across all collections.
    ///
    /// The exchange handler writes these kinds for many collections from
    /// one contract; its rewind path uses this. Transfers belong to the
    /// per-contract trackers and are left for their own rewinds.
    pub async fn delete_exchange_activity_from_block(
        &self,
        chain_id: u64,
        from_block: u64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM activity_history
            WHERE chain_id = ?
              AND kind IN ('sale', 'cancelListing', 'cancelOffer')
              AND block_number IS NOT NULL AND block_number >= ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .execute(&self.pool)
        .await
        .context("Failed to delete exchange activity")?;

        Ok(result.rows_affected())
    }

    /// Activity entries for one token, newest first.
    pub async fn list_activity_for_token(
        &self,
        chain_id: u64,
        collection: &Address,
        token_id: &U256,
        limit: u32,
    ) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, collection, token_id, kind,
                   account, to_account, quantity,
                   price, price_in_usd, price_in_native,
                   block_number, tx_hash, log_index, time, source
            FROM activity_history
            WHERE chain_id = ? AND collection = ? AND token_id = ?
            ORDER BY time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(token_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_activity).collect()
    }

    /// Sum of sale volume for a collection since a point in time.
    ///
    /// Returns `(native, usd)` totals.
    pub async fn sum_sale_volume_since(
        &self,
        chain_id: u64,
        collection: &Address,
        since: i64,
    ) -> Result<(f64, f64)> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(price_in_native), 0) AS native,
                   COALESCE(SUM(price_in_usd), 0) AS usd
            FROM activity_history
            WHERE chain_id = ? AND collection = ? AND kind = 'sale' AND time >= ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.get("native"), row.get("usd")))
    }

    fn row_to_activity(row: sqlx::sqlite::SqliteRow) -> Result<ActivityRecord> {
        let collection: String = row.get("collection");
        let token_id: String = row.get("token_id");
        let kind: String = row.get("kind");
        let price: String = row.get("price");
        let tx_hash: Option<String> = row.get("tx_hash");

        Ok(ActivityRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            collection: parse_address(&collection)?,
            token_id: token_id
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?,
            kind: ActivityKind::from_str(&kind)?,
            account: row.get("account"),
            to_account: row.get("to_account"),
            quantity: row.get::<i64, _>("quantity") as u64,
            price: price
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid price in database: {e}"))?,
            price_in_usd: row.get("price_in_usd"),
            price_in_native: row.get("price_in_native"),
            block_number: row.get::<Option<i64>, _>("block_number").map(|v| v as u64),
            tx_hash: tx_hash
                .as_deref()
                .map(|s| {
                    s.parse::<B256>()
                        .map_err(|e| anyhow::anyhow!("Invalid tx hash in database: {e}"))
                })
                .transpose()?,
            log_index: row.get::<Option<i64>, _>("log_index").map(|v| v as u64),
            time: row.get("time"),
            source: row.get("source"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;
    use alloy::primitives::address;

    const COLLECTION: Address = address!("0000000000000000000000000000000000000101");

    fn transfer(tx_byte: u8, log_index: u64, block: u64) -> ActivityRecord {
        ActivityRecord {
            chain_id: 1,
            collection: COLLECTION,
            token_id: U256::from(1),
            kind: ActivityKind::Transfer,
            account: "0xaa".into(),
            to_account: "0xbb".into(),
            quantity: 1,
            price: U256::ZERO,
            price_in_usd: 0.0,
            price_in_native: 0.0,
            block_number: Some(block),
            tx_hash: Some(B256::repeat_byte(tx_byte)),
            log_index: Some(log_index),
            time: block as i64 * 12,
            source: String::new(),
        }
    }

    #[tokio::test]
    async fn test_transfer_replay_is_dropped() {
        let (storage, _temp_db) = test_storage().await;

        let entry = transfer(0x01, 3, 100);
        assert!(storage.insert_activity(&entry).await.unwrap());
        assert!(!storage.insert_activity(&entry).await.unwrap());

        let listed = storage
            .list_activity_for_token(1, &COLLECTION, &U256::from(1), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_offchain_entries_are_not_deduplicated() {
        let (storage, _temp_db) = test_storage().await;

        let listing = ActivityRecord {
            kind: ActivityKind::List,
            block_number: None,
            tx_hash: None,
            log_index: None,
            price: U256::from(5),
            price_in_native: 1.0,
            price_in_usd: 2000.0,
            ..transfer(0, 0, 0)
        };

        assert!(storage.insert_activity(&listing).await.unwrap());
        assert!(storage.insert_activity(&listing).await.unwrap());
    }

    #[tokio::test]
    async fn test_rewind_deletes_only_chain_entries() {
        let (storage, _temp_db) = test_storage().await;

        storage.insert_activity(&transfer(0x01, 0, 100)).await.unwrap();
        storage.insert_activity(&transfer(0x02, 0, 105)).await.unwrap();

        let listing = ActivityRecord {
            kind: ActivityKind::List,
            block_number: None,
            tx_hash: None,
            log_index: None,
            ..transfer(0, 0, 0)
        };
        storage.insert_activity(&listing).await.unwrap();

        let deleted = storage
            .delete_chain_activity_from_block(1, &COLLECTION, 105)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let listed = storage
            .list_activity_for_token(1, &COLLECTION, &U256::from(1), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_sale_volume_window() {
        let (storage, _temp_db) = test_storage().await;

        for (time, native, usd) in [(100, 1.0, 2000.0), (200, 2.0, 4000.0)] {
            let sale = ActivityRecord {
                kind: ActivityKind::Sale,
                block_number: Some(1),
                tx_hash: Some(B256::repeat_byte(time as u8)),
                log_index: Some(0),
                time,
                price_in_native: native,
                price_in_usd: usd,
                ..transfer(0, 0, 0)
            };
            storage.insert_activity(&sale).await.unwrap();
        }

        let (native, usd) = storage
            .sum_sale_volume_since(1, &COLLECTION, 150)
            .await
            .unwrap();
        assert_eq!(native, 2.0);
        assert_eq!(usd, 4000.0);
    }
}
