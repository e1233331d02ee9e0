//! Collection and contract catalog storage operations.

use super::{CollectionRecord, ContractEntry, Storage};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address, TokenType};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

impl Storage {
    /// Insert a collection row if it does not exist yet.
    ///
    /// Returns `true` if a new row was created.
    pub async fn ensure_collection(
        &self,
        chain_id: u64,
        address: &Address,
        token_type: TokenType,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO collections (chain_id, address, token_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chain_id, address) DO NOTHING
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(token_type.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to ensure collection")?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch a collection by address.
    pub async fn get_collection(
        &self,
        chain_id: u64,
        address: &Address,
    ) -> Result<Option<CollectionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, address, name, token_type, supply, num_owners,
                   floor_price_native, floor_price_usd,
                   opensea_floor_native, opensea_floor_usd,
                   highest_sale, has_been_sold, last_sold_at, last_listed_at,
                   attributes, trait_floor_price, attributes_hash,
                   should_calculate_openrarity, is_appropriate,
                   royalty_override, created_at, updated_at
            FROM collections
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_collection).transpose()
    }

    /// All collections on a chain.
    pub async fn list_collections(&self, chain_id: u64) -> Result<Vec<CollectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, address, name, token_type, supply, num_owners,
                   floor_price_native, floor_price_usd,
                   opensea_floor_native, opensea_floor_usd,
                   highest_sale, has_been_sold, last_sold_at, last_listed_at,
                   attributes, trait_floor_price, attributes_hash,
                   should_calculate_openrarity, is_appropriate,
                   royalty_override, created_at, updated_at
            FROM collections
            WHERE chain_id = ?
            ORDER BY address
            "#,
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_collection).collect()
    }

    /// Replace the derived stats of a collection.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_collection_stats(
        &self,
        chain_id: u64,
        address: &Address,
        supply: u64,
        num_owners: u64,
        attributes: &BTreeMap<String, BTreeMap<String, u64>>,
        attributes_hash: &str,
        should_calculate_openrarity: bool,
        now: i64,
    ) -> Result<()> {
        let attributes_json =
            serde_json::to_string(attributes).context("Failed to serialize trait histogram")?;

        sqlx::query(
            r#"
            UPDATE collections
            SET supply = ?,
                num_owners = ?,
                attributes = ?,
                attributes_hash = ?,
                should_calculate_openrarity = ?,
                updated_at = ?
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(supply as i64)
        .bind(num_owners as i64)
        .bind(attributes_json)
        .bind(attributes_hash)
        .bind(should_calculate_openrarity)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .execute(&self.pool)
        .await
        .context("Failed to update collection stats")?;

        Ok(())
    }

    /// Replace the floor price and trait floor projection of a collection.
    pub async fn update_collection_floor(
        &self,
        chain_id: u64,
        address: &Address,
        floor_native: f64,
        floor_usd: f64,
        trait_floor: &BTreeMap<String, BTreeMap<String, f64>>,
        now: i64,
    ) -> Result<()> {
        let trait_floor_json =
            serde_json::to_string(trait_floor).context("Failed to serialize trait floors")?;

        sqlx::query(
            r#"
            UPDATE collections
            SET floor_price_native = ?,
                floor_price_usd = ?,
                trait_floor_price = ?,
                updated_at = ?
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(floor_native)
        .bind(floor_usd)
        .bind(trait_floor_json)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .execute(&self.pool)
        .await
        .context("Failed to update collection floor")?;

        Ok(())
    }

    /// Record a sale against the collection.
    ///
    /// Bumps `highest_sale` only when the new native price exceeds it.
    pub async fn record_collection_sale(
        &self,
        chain_id: u64,
        address: &Address,
        price_in_native: f64,
        time: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collections
            SET has_been_sold = 1,
                last_sold_at = ?,
                highest_sale = MAX(highest_sale, ?),
                updated_at = ?
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(time)
        .bind(price_in_native)
        .bind(time)
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .execute(&self.pool)
        .await
        .context("Failed to record collection sale")?;

        Ok(())
    }

    /// Record that a listing was placed against the collection.
    pub async fn record_collection_listing(
        &self,
        chain_id: u64,
        address: &Address,
        time: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collections
            SET last_listed_at = ?, updated_at = ?
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(time)
        .bind(time)
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .execute(&self.pool)
        .await
        .context("Failed to record collection listing")?;

        Ok(())
    }

    /// Store an on-chain royalty override for the collection, as a JSON blob
    /// of `{receiver, fee_bps}`.
    pub async fn set_collection_royalty(
        &self,
        chain_id: u64,
        address: &Address,
        royalty_json: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collections
            SET royalty_override = ?, updated_at = ?
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(royalty_json)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .execute(&self.pool)
        .await
        .context("Failed to set collection royalty")?;

        Ok(())
    }

    /// Upsert a contract catalog entry.
    pub async fn upsert_contract(&self, entry: &ContractEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contracts (chain_id, address, token_type, is_appropriate)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chain_id, address) DO UPDATE SET
                token_type = excluded.token_type,
                is_appropriate = excluded.is_appropriate
            "#,
        )
        .bind(entry.chain_id as i64)
        .bind(lowercase_address(&entry.address))
        .bind(entry.token_type.as_str())
        .bind(entry.is_appropriate)
        .execute(&self.pool)
        .await
        .context("Failed to upsert contract")?;

        Ok(())
    }

    /// Catalog entries flagged appropriate for tracking.
    pub async fn list_appropriate_contracts(&self, chain_id: u64) -> Result<Vec<ContractEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, address, token_type, is_appropriate
            FROM contracts
            WHERE chain_id = ? AND is_appropriate = 1
            ORDER BY address
            "#,
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let address: String = row.get("address");
                let token_type: String = row.get("token_type");
                Ok(ContractEntry {
                    chain_id: row.get::<i64, _>("chain_id") as u64,
                    address: parse_address(&address)?,
                    token_type: TokenType::from_str(&token_type)?,
                    is_appropriate: row.get("is_appropriate"),
                })
            })
            .collect()
    }

    fn row_to_collection(row: sqlx::sqlite::SqliteRow) -> Result<CollectionRecord> {
        let address: String = row.get("address");
        let token_type: String = row.get("token_type");
        let attributes: String = row.get("attributes");
        let trait_floor_price: String = row.get("trait_floor_price");

        Ok(CollectionRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            address: parse_address(&address)?,
            name: row.get("name"),
            token_type: TokenType::from_str(&token_type)?,
            supply: row.get::<i64, _>("supply") as u64,
            num_owners: row.get::<i64, _>("num_owners") as u64,
            floor_price_native: row.get("floor_price_native"),
            floor_price_usd: row.get("floor_price_usd"),
            opensea_floor_native: row.get("opensea_floor_native"),
            opensea_floor_usd: row.get("opensea_floor_usd"),
            highest_sale: row.get("highest_sale"),
            has_been_sold: row.get("has_been_sold"),
            last_sold_at: row.get("last_sold_at"),
            last_listed_at: row.get("last_listed_at"),
            attributes: serde_json::from_str(&attributes)
                .context("Invalid trait histogram in database")?,
            trait_floor_price: serde_json::from_str(&trait_floor_price)
                .context("Invalid trait floors in database")?,
            attributes_hash: row.get("attributes_hash"),
            should_calculate_openrarity: row.get("should_calculate_openrarity"),
            is_appropriate: row.get("is_appropriate"),
            royalty_override: row.get("royalty_override"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;
    use alloy::primitives::address;

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent() {
        let (storage, _temp_db) = test_storage().await;
        let addr = address!("00000000000000000000000000000000000000a1");

        assert!(storage
            .ensure_collection(1, &addr, TokenType::Erc721, 100)
            .await
            .unwrap());
        assert!(!storage
            .ensure_collection(1, &addr, TokenType::Erc721, 200)
            .await
            .unwrap());

        let col = storage.get_collection(1, &addr).await.unwrap().unwrap();
        assert_eq!(col.token_type, TokenType::Erc721);
        assert_eq!(col.created_at, 100);
        assert!(!col.has_been_sold);
    }

    #[tokio::test]
    async fn test_record_collection_sale_keeps_highest() {
        let (storage, _temp_db) = test_storage().await;
        let addr = address!("00000000000000000000000000000000000000a2");

        storage
            .ensure_collection(1, &addr, TokenType::Erc721, 0)
            .await
            .unwrap();

        storage.record_collection_sale(1, &addr, 2.5, 10).await.unwrap();
        storage.record_collection_sale(1, &addr, 1.0, 20).await.unwrap();

        let col = storage.get_collection(1, &addr).await.unwrap().unwrap();
        assert!(col.has_been_sold);
        assert_eq!(col.highest_sale, 2.5);
        assert_eq!(col.last_sold_at, Some(20));
    }

    #[tokio::test]
    async fn test_contract_catalog() {
        let (storage, _temp_db) = test_storage().await;

        let good = ContractEntry {
            chain_id: 1,
            address: address!("00000000000000000000000000000000000000b1"),
            token_type: TokenType::Erc1155,
            is_appropriate: true,
        };
        let bad = ContractEntry {
            chain_id: 1,
            address: address!("00000000000000000000000000000000000000b2"),
            token_type: TokenType::Erc721,
            is_appropriate: false,
        };

        storage.upsert_contract(&good).await.unwrap();
        storage.upsert_contract(&bad).await.unwrap();

        let listed = storage.list_appropriate_contracts(1).await.unwrap();
        assert_eq!(listed, vec![good.clone()]);

        // Flipping the flag surfaces the contract in the scan.
        let mut bad = bad;
        bad.is_appropriate = true;
        storage.upsert_contract(&bad).await.unwrap();
        assert_eq!(storage.list_appropriate_contracts(1).await.unwrap().len(), 2);
    }
}
