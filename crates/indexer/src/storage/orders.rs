//! Order, order item and signer nonce storage operations.

use super::{NonceRecord, OrderItemRecord, OrderRecord, Storage};
use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address, OrderStrategy};
use sqlx::Row;
use std::str::FromStr;

impl Storage {
    /// Insert a validated order envelope.
    pub async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                chain_id, order_hash, is_ask, signer,
                strategy, strategy_kind, currency, nonce,
                start_time, end_time, min_percentage_to_ask,
                marketplace, params, sig_v, sig_r, sig_s,
                fee_dist_type, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.chain_id as i64)
        .bind(order.order_hash.to_string())
        .bind(order.is_ask)
        .bind(lowercase_address(&order.signer))
        .bind(lowercase_address(&order.strategy))
        .bind(order.strategy_kind.as_str())
        .bind(lowercase_address(&order.currency))
        .bind(order.nonce as i64)
        .bind(order.start_time)
        .bind(order.end_time)
        .bind(order.min_percentage_to_ask as i64)
        .bind(&order.marketplace)
        .bind(&order.params)
        .bind(order.sig_v as i64)
        .bind(order.sig_r.to_string())
        .bind(order.sig_s.to_string())
        .bind(&order.fee_dist_type)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert order")?;

        Ok(())
    }

    /// Delete an order and its items (rollback path for failed placement).
    pub async fn delete_order(&self, chain_id: u64, order_hash: &B256) -> Result<()> {
        sqlx::query("DELETE FROM order_items WHERE chain_id = ? AND order_hash = ?")
            .bind(chain_id as i64)
            .bind(order_hash.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete order items")?;

        sqlx::query("DELETE FROM orders WHERE chain_id = ? AND order_hash = ?")
            .bind(chain_id as i64)
            .bind(order_hash.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete order")?;

        Ok(())
    }

    /// Fetch an order envelope by hash.
    pub async fn get_order(&self, chain_id: u64, order_hash: &B256) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, order_hash, is_ask, signer,
                   strategy, strategy_kind, currency, nonce,
                   start_time, end_time, min_percentage_to_ask,
                   marketplace, params, sig_v, sig_r, sig_s,
                   fee_dist_type, created_at
            FROM orders
            WHERE chain_id = ? AND order_hash = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(order_hash.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    /// Whether a signer has already used a nonce.
    pub async fn has_order_with_nonce(
        &self,
        chain_id: u64,
        signer: &Address,
        nonce: u64,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE chain_id = ? AND signer = ? AND nonce = ?",
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(signer))
        .bind(nonce as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Insert one denormalized order item.
    pub async fn insert_order_item(&self, item: &OrderItemRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_items (
                chain_id, order_hash, item_idx, order_item_hash, hex_nonce,
                is_ask, signer, collection, token_id, amount, price,
                strategy, strategy_kind, currency, nonce,
                start_time, end_time,
                display_price, price_in_usd, price_in_native,
                reserved_buyer, is_valid, is_used, marketplace, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.chain_id as i64)
        .bind(item.order_hash.to_string())
        .bind(item.item_idx as i64)
        .bind(item.order_item_hash.to_string())
        .bind(&item.hex_nonce)
        .bind(item.is_ask)
        .bind(lowercase_address(&item.signer))
        .bind(lowercase_address(&item.collection))
        .bind(item.token_id.to_string())
        .bind(item.amount as i64)
        .bind(item.price.to_string())
        .bind(lowercase_address(&item.strategy))
        .bind(item.strategy_kind.as_str())
        .bind(lowercase_address(&item.currency))
        .bind(item.nonce as i64)
        .bind(item.start_time)
        .bind(item.end_time)
        .bind(item.display_price)
        .bind(item.price_in_usd)
        .bind(item.price_in_native)
        .bind(item.reserved_buyer.as_ref().map(lowercase_address))
        .bind(item.is_valid)
        .bind(item.is_used)
        .bind(&item.marketplace)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert order item")?;

        Ok(())
    }

    /// All items of an order, in item index order.
    pub async fn get_order_items(
        &self,
        chain_id: u64,
        order_hash: &B256,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            "{ORDER_ITEM_COLUMNS} WHERE chain_id = ? AND order_hash = ? ORDER BY item_idx"
        ))
        .bind(chain_id as i64)
        .bind(order_hash.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Order items matching an exchange-side order item hash.
    pub async fn get_order_items_by_item_hash(
        &self,
        chain_id: u64,
        order_item_hash: &B256,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            "{ORDER_ITEM_COLUMNS} WHERE chain_id = ? AND order_item_hash = ?"
        ))
        .bind(chain_id as i64)
        .bind(order_item_hash.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Cancel open order items by exchange-side hash (`isUsed = true`).
    ///
    /// Returns the items that were still open, so callers can write cancel
    /// activities and refresh the touched tokens.
    pub async fn cancel_order_items_by_hashes(
        &self,
        chain_id: u64,
        hashes: &[B256],
    ) -> Result<Vec<OrderItemRecord>> {
        let mut affected = Vec::new();
        for hash in hashes {
            let open: Vec<OrderItemRecord> = self
                .get_order_items_by_item_hash(chain_id, hash)
                .await?
                .into_iter()
                .filter(|item| !item.is_used)
                .collect();

            sqlx::query(
                "UPDATE order_items SET is_used = 1 WHERE chain_id = ? AND order_item_hash = ?",
            )
            .bind(chain_id as i64)
            .bind(hash.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to cancel order items")?;

            affected.extend(open);
        }
        Ok(affected)
    }

    /// Cancel every open order item of a signer with a nonce below the
    /// cutoff.
    ///
    /// Returns the items that were still open.
    pub async fn cancel_order_items_below_nonce(
        &self,
        chain_id: u64,
        signer: &Address,
        cutoff: u64,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            "{ORDER_ITEM_COLUMNS} WHERE chain_id = ? AND signer = ? AND nonce < ? AND is_used = 0"
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(signer))
        .bind(cutoff as i64)
        .fetch_all(&self.pool)
        .await?;

        let affected: Result<Vec<_>> = rows.into_iter().map(Self::row_to_order_item).collect();
        let affected = affected?;

        sqlx::query(
            "UPDATE order_items SET is_used = 1 WHERE chain_id = ? AND signer = ? AND nonce < ?",
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(signer))
        .bind(cutoff as i64)
        .execute(&self.pool)
        .await
        .context("Failed to cancel order items below nonce")?;

        Ok(affected)
    }

    /// Recompute-and-store validity for one order item (RefreshOrders).
    pub async fn set_order_item_validity(
        &self,
        chain_id: u64,
        order_hash: &B256,
        item_idx: u32,
        is_valid: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE order_items SET is_valid = ? WHERE chain_id = ? AND order_hash = ? AND item_idx = ?",
        )
        .bind(is_valid)
        .bind(chain_id as i64)
        .bind(order_hash.to_string())
        .bind(item_idx as i64)
        .execute(&self.pool)
        .await
        .context("Failed to set order item validity")?;

        Ok(())
    }

    /// Store re-derived prices for one order item (RefreshOrders).
    pub async fn set_order_item_prices(
        &self,
        chain_id: u64,
        order_hash: &B256,
        item_idx: u32,
        display_price: f64,
        price_in_usd: f64,
        price_in_native: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE order_items
            SET display_price = ?, price_in_usd = ?, price_in_native = ?
            WHERE chain_id = ? AND order_hash = ? AND item_idx = ?
            "#,
        )
        .bind(display_price)
        .bind(price_in_usd)
        .bind(price_in_native)
        .bind(chain_id as i64)
        .bind(order_hash.to_string())
        .bind(item_idx as i64)
        .execute(&self.pool)
        .await
        .context("Failed to set order item prices")?;

        Ok(())
    }

    /// Live order items for one token and side.
    ///
    /// Asks come back cheapest first, offers highest first; ties break to
    /// the newest item, then the smallest order item hash.
    pub async fn list_live_order_items_for_token(
        &self,
        chain_id: u64,
        collection: &Address,
        token_id: &U256,
        is_ask: bool,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let order_clause = if is_ask {
            "ORDER BY price_in_native ASC, created_at DESC, order_item_hash ASC"
        } else {
            "ORDER BY price_in_native DESC, created_at DESC, order_item_hash ASC"
        };

        let rows = sqlx::query(&format!(
            r#"
            {ORDER_ITEM_COLUMNS}
            WHERE chain_id = ? AND collection = ? AND token_id = ? AND is_ask = ?
              AND is_valid = 1 AND is_used = 0
              AND start_time <= ? AND end_time > ?
            {order_clause}
            "#
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(token_id.to_string())
        .bind(is_ask)
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Active asks on one token, validity ignored.
    ///
    /// RefreshOrders re-derives `is_valid` for exactly these rows; the
    /// projection also splits them into active and inactive listings.
    pub async fn list_active_asks_for_token(
        &self,
        chain_id: u64,
        collection: &Address,
        token_id: &U256,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            {ORDER_ITEM_COLUMNS}
            WHERE chain_id = ? AND collection = ? AND token_id = ? AND is_ask = 1
              AND is_used = 0 AND start_time <= ? AND end_time > ?
            ORDER BY price_in_native ASC, created_at DESC, order_item_hash ASC
            "#
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(token_id.to_string())
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Active offers on one token, highest first, including collection
    /// offers on the same contract.
    pub async fn list_active_offers_for_token(
        &self,
        chain_id: u64,
        collection: &Address,
        token_id: &U256,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            {ORDER_ITEM_COLUMNS}
            WHERE chain_id = ? AND collection = ? AND is_ask = 0
              AND (token_id = ? OR strategy_kind = 'collectionOffer')
              AND is_used = 0 AND start_time <= ? AND end_time > ?
            ORDER BY price_in_native DESC, created_at DESC, order_item_hash ASC
            "#
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(token_id.to_string())
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Live listings across a whole collection (floor computation).
    pub async fn list_live_listings_for_collection(
        &self,
        chain_id: u64,
        collection: &Address,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            {ORDER_ITEM_COLUMNS}
            WHERE chain_id = ? AND collection = ? AND is_ask = 1
              AND is_valid = 1 AND is_used = 0
              AND start_time <= ? AND end_time > ?
            ORDER BY price_in_native ASC
            "#
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    /// Distinct tokens of a collection that have any order item rows.
    pub async fn list_tokens_with_orders(
        &self,
        chain_id: u64,
        collection: &Address,
    ) -> Result<Vec<U256>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT token_id FROM order_items
            WHERE chain_id = ? AND collection = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(collection))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|s| {
                s.parse::<U256>()
                    .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))
            })
            .collect()
    }

    /// Per-signer nonce bookkeeping; defaults to zeroes when absent.
    pub async fn get_nonce_record(&self, chain_id: u64, address: &Address) -> Result<NonceRecord> {
        let row = sqlx::query(
            r#"
            SELECT min_valid_order_nonce, available_nonce
            FROM order_nonces
            WHERE chain_id = ? AND address = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => NonceRecord {
                min_valid_order_nonce: row.get::<i64, _>("min_valid_order_nonce") as u64,
                available_nonce: row.get::<i64, _>("available_nonce") as u64,
            },
            None => NonceRecord::default(),
        })
    }

    /// Raise the minimum valid nonce of a signer (never lowers it).
    pub async fn set_min_valid_order_nonce(
        &self,
        chain_id: u64,
        address: &Address,
        min_nonce: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_nonces (chain_id, address, min_valid_order_nonce, available_nonce)
            VALUES (?1, ?2, ?3, 0)
            ON CONFLICT(chain_id, address)
            DO UPDATE SET min_valid_order_nonce = MAX(min_valid_order_nonce, ?3)
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(min_nonce as i64)
        .execute(&self.pool)
        .await
        .context("Failed to set min valid order nonce")?;

        Ok(())
    }

    /// Advance the next-available nonce past a just-used one.
    pub async fn bump_available_nonce(
        &self,
        chain_id: u64,
        address: &Address,
        used_nonce: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_nonces (chain_id, address, min_valid_order_nonce, available_nonce)
            VALUES (?1, ?2, 0, ?3 + 1)
            ON CONFLICT(chain_id, address)
            DO UPDATE SET available_nonce = MAX(available_nonce, ?3 + 1)
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(used_nonce as i64)
        .execute(&self.pool)
        .await
        .context("Failed to bump available nonce")?;

        Ok(())
    }

    fn row_to_order(row: sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
        let order_hash: String = row.get("order_hash");
        let signer: String = row.get("signer");
        let strategy: String = row.get("strategy");
        let strategy_kind: String = row.get("strategy_kind");
        let currency: String = row.get("currency");
        let sig_r: String = row.get("sig_r");
        let sig_s: String = row.get("sig_s");

        Ok(OrderRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            order_hash: order_hash
                .parse::<B256>()
                .map_err(|e| anyhow::anyhow!("Invalid order hash in database: {e}"))?,
            is_ask: row.get("is_ask"),
            signer: parse_address(&signer)?,
            strategy: parse_address(&strategy)?,
            strategy_kind: OrderStrategy::from_str(&strategy_kind)?,
            currency: parse_address(&currency)?,
            nonce: row.get::<i64, _>("nonce") as u64,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            min_percentage_to_ask: row.get::<i64, _>("min_percentage_to_ask") as u64,
            marketplace: row.get("marketplace"),
            params: row.get("params"),
            sig_v: row.get::<i64, _>("sig_v") as u8,
            sig_r: sig_r
                .parse::<B256>()
                .map_err(|e| anyhow::anyhow!("Invalid signature r in database: {e}"))?,
            sig_s: sig_s
                .parse::<B256>()
                .map_err(|e| anyhow::anyhow!("Invalid signature s in database: {e}"))?,
            fee_dist_type: row.get("fee_dist_type"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_order_item(row: sqlx::sqlite::SqliteRow) -> Result<OrderItemRecord> {
        let order_hash: String = row.get("order_hash");
        let order_item_hash: String = row.get("order_item_hash");
        let signer: String = row.get("signer");
        let collection: String = row.get("collection");
        let token_id: String = row.get("token_id");
        let price: String = row.get("price");
        let strategy: String = row.get("strategy");
        let strategy_kind: String = row.get("strategy_kind");
        let currency: String = row.get("currency");
        let reserved_buyer: Option<String> = row.get("reserved_buyer");

        Ok(OrderItemRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            order_hash: order_hash
                .parse::<B256>()
                .map_err(|e| anyhow::anyhow!("Invalid order hash in database: {e}"))?,
            item_idx: row.get::<i64, _>("item_idx") as u32,
            order_item_hash: order_item_hash
                .parse::<B256>()
                .map_err(|e| anyhow::anyhow!("Invalid order item hash in database: {e}"))?,
            hex_nonce: row.get("hex_nonce"),
            is_ask: row.get("is_ask"),
            signer: parse_address(&signer)?,
            collection: parse_address(&collection)?,
            token_id: token_id
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?,
            amount: row.get::<i64, _>("amount") as u64,
            price: price
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid price in database: {e}"))?,
            strategy: parse_address(&strategy)?,
            strategy_kind: OrderStrategy::from_str(&strategy_kind)?,
            currency: parse_address(&currency)?,
            nonce: row.get::<i64, _>("nonce") as u64,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            display_price: row.get("display_price"),
            price_in_usd: row.get("price_in_usd"),
            price_in_native: row.get("price_in_native"),
            reserved_buyer: reserved_buyer.as_deref().map(parse_address).transpose()?,
            is_valid: row.get("is_valid"),
            is_used: row.get("is_used"),
            marketplace: row.get("marketplace"),
            created_at: row.get("created_at"),
        })
    }
}

const ORDER_ITEM_COLUMNS: &str = r#"
    SELECT chain_id, order_hash, item_idx, order_item_hash, hex_nonce,
           is_ask, signer, collection, token_id, amount, price,
           strategy, strategy_kind, currency, nonce,
           start_time, end_time,
           display_price, price_in_usd, price_in_native,
           reserved_buyer, is_valid, is_used, marketplace, created_at
    FROM order_items
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;
    use alloy::primitives::address;

    const SIGNER: Address = address!("00000000000000000000000000000000000000f1");
    const COLLECTION: Address = address!("00000000000000000000000000000000000000f2");
    const STRATEGY: Address = address!("00000000000000000000000000000000000000f3");
    const WETH: Address = address!("00000000000000000000000000000000000000f4");

    fn order(nonce: u64, hash_byte: u8) -> OrderRecord {
        OrderRecord {
            chain_id: 1,
            order_hash: B256::repeat_byte(hash_byte),
            is_ask: true,
            signer: SIGNER,
            strategy: STRATEGY,
            strategy_kind: OrderStrategy::FixedPrice,
            currency: WETH,
            nonce,
            start_time: 0,
            end_time: 10_000,
            min_percentage_to_ask: 8500,
            marketplace: "x".into(),
            params: "0x".into(),
            sig_v: 27,
            sig_r: B256::repeat_byte(0x11),
            sig_s: B256::repeat_byte(0x22),
            fee_dist_type: String::new(),
            created_at: 100,
        }
    }

    fn order_item(nonce: u64, hash_byte: u8, price_native: f64, created_at: i64) -> OrderItemRecord {
        OrderItemRecord {
            chain_id: 1,
            order_hash: B256::repeat_byte(hash_byte),
            item_idx: 0,
            order_item_hash: B256::repeat_byte(hash_byte ^ 0xff),
            hex_nonce: format!("{nonce:#x}"),
            is_ask: true,
            signer: SIGNER,
            collection: COLLECTION,
            token_id: U256::from(1),
            amount: 1,
            price: U256::from(1_000_000u64),
            strategy: STRATEGY,
            strategy_kind: OrderStrategy::FixedPrice,
            currency: WETH,
            nonce,
            start_time: 0,
            end_time: 10_000,
            display_price: price_native,
            price_in_usd: price_native * 2000.0,
            price_in_native: price_native,
            reserved_buyer: None,
            is_valid: true,
            is_used: false,
            marketplace: "x".into(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_order_roundtrip_and_nonce_check() {
        let (storage, _temp_db) = test_storage().await;

        let order = order(1, 0x01);
        storage.insert_order(&order).await.unwrap();

        let got = storage.get_order(1, &order.order_hash).await.unwrap().unwrap();
        assert_eq!(got, order);

        assert!(storage.has_order_with_nonce(1, &SIGNER, 1).await.unwrap());
        assert!(!storage.has_order_with_nonce(1, &SIGNER, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_order_removes_items() {
        let (storage, _temp_db) = test_storage().await;

        storage.insert_order(&order(1, 0x01)).await.unwrap();
        storage
            .insert_order_item(&order_item(1, 0x01, 1.0, 100))
            .await
            .unwrap();

        storage.delete_order(1, &B256::repeat_byte(0x01)).await.unwrap();

        assert!(storage
            .get_order(1, &B256::repeat_byte(0x01))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .get_order_items(1, &B256::repeat_byte(0x01))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_live_asks_cheapest_first() {
        let (storage, _temp_db) = test_storage().await;

        storage
            .insert_order_item(&order_item(1, 0x01, 2.0, 100))
            .await
            .unwrap();
        storage
            .insert_order_item(&order_item(2, 0x02, 1.0, 100))
            .await
            .unwrap();
        storage
            .insert_order_item(&order_item(3, 0x03, 3.0, 100))
            .await
            .unwrap();

        let live = storage
            .list_live_order_items_for_token(1, &COLLECTION, &U256::from(1), true, 500)
            .await
            .unwrap();
        let prices: Vec<f64> = live.iter().map(|i| i.price_in_native).collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_live_query_excludes_expired_and_used() {
        let (storage, _temp_db) = test_storage().await;

        let mut expired = order_item(1, 0x01, 1.0, 100);
        expired.end_time = 400;
        storage.insert_order_item(&expired).await.unwrap();

        let mut used = order_item(2, 0x02, 1.0, 100);
        used.is_used = true;
        storage.insert_order_item(&used).await.unwrap();

        storage
            .insert_order_item(&order_item(3, 0x03, 1.0, 100))
            .await
            .unwrap();

        let live = storage
            .list_live_order_items_for_token(1, &COLLECTION, &U256::from(1), true, 500)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].nonce, 3);
    }

    #[tokio::test]
    async fn test_cancel_below_nonce_marks_used() {
        let (storage, _temp_db) = test_storage().await;

        for nonce in 1..=3u64 {
            storage
                .insert_order_item(&order_item(nonce, nonce as u8, 1.0, 100))
                .await
                .unwrap();
        }

        let affected = storage
            .cancel_order_items_below_nonce(1, &SIGNER, 3)
            .await
            .unwrap();
        assert_eq!(affected.len(), 2);

        // A second pass finds nothing still open.
        let again = storage
            .cancel_order_items_below_nonce(1, &SIGNER, 3)
            .await
            .unwrap();
        assert!(again.is_empty());

        let live = storage
            .list_live_order_items_for_token(1, &COLLECTION, &U256::from(1), true, 500)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].nonce, 3);
    }

    #[tokio::test]
    async fn test_cancel_by_hash_and_validity_flip() {
        let (storage, _temp_db) = test_storage().await;

        let item = order_item(1, 0x01, 1.0, 100);
        storage.insert_order_item(&item).await.unwrap();

        storage
            .set_order_item_validity(1, &item.order_hash, 0, false)
            .await
            .unwrap();
        let got = &storage.get_order_items(1, &item.order_hash).await.unwrap()[0];
        assert!(!got.is_valid);
        assert!(!got.is_used);

        let affected = storage
            .cancel_order_items_by_hashes(1, &[item.order_item_hash])
            .await
            .unwrap();
        assert_eq!(affected.len(), 1);
        let got = &storage.get_order_items(1, &item.order_hash).await.unwrap()[0];
        assert!(got.is_used);
    }

    #[tokio::test]
    async fn test_nonce_bookkeeping_is_monotone() {
        let (storage, _temp_db) = test_storage().await;

        assert_eq!(
            storage.get_nonce_record(1, &SIGNER).await.unwrap(),
            NonceRecord::default()
        );

        storage.set_min_valid_order_nonce(1, &SIGNER, 5).await.unwrap();
        storage.set_min_valid_order_nonce(1, &SIGNER, 3).await.unwrap();
        storage.bump_available_nonce(1, &SIGNER, 9).await.unwrap();
        storage.bump_available_nonce(1, &SIGNER, 2).await.unwrap();

        let record = storage.get_nonce_record(1, &SIGNER).await.unwrap();
        assert_eq!(record.min_valid_order_nonce, 5);
        assert_eq!(record.available_nonce, 10);
    }
}
