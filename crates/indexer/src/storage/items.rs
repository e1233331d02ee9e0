//! Item storage operations.

use super::{ItemRecord, Storage};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use nfttrack_core::{
    lowercase_address, parse_address, Attribute, IndexerState, PriceSource, TokenType,
};
use sqlx::Row;
use std::str::FromStr;

/// Listing/offer projection written back by order refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingProjection {
    pub has_order: bool,
    pub has_active_listings: bool,
    pub listing_ends_at: i64,
    pub listing_owners: Vec<String>,
    pub inactive_listing_owners: Vec<String>,
    pub offer_starts_at: i64,
    pub offer_ends_at: i64,
    pub offer_owners: Vec<String>,
    /// Set when a fresh listing was just placed.
    pub listed_at: Option<i64>,
}

/// Price projection written back by order refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceProjection {
    pub price: f64,
    pub payment_token: String,
    pub price_in_usd: f64,
    pub price_source: PriceSource,
    pub instant_liquidity_usd: f64,
}

impl Storage {
    /// Insert an item row if it does not exist yet.
    ///
    /// Returns `true` if a new row was created.
    pub async fn ensure_item(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        token_type: TokenType,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO nft_items (chain_id, contract, token_id, token_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chain_id, contract, token_id) DO NOTHING
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .bind(token_type.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to ensure item")?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch an item by key.
    pub async fn get_item(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
    ) -> Result<Option<ItemRecord>> {
        let row = sqlx::query(&format!(
            "{ITEM_COLUMNS} WHERE chain_id = ? AND contract = ? AND token_id = ?"
        ))
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_item).transpose()
    }

    /// Set the current owner of a single-owner item.
    ///
    /// A transfer is fresh evidence the token is alive, so the indexer
    /// retry counter resets alongside.
    pub async fn set_item_owner(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        owner: &Address,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET owner = ?, indexer_retry_count = 0, updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(lowercase_address(owner))
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to set item owner")?;

        Ok(())
    }

    /// Update the 1155 aggregates (total supply, distinct owners) of an item.
    pub async fn update_item_supply(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        supply: u64,
        num_owners: u64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET supply = ?, num_owners = ?, updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(supply as i64)
        .bind(num_owners as i64)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update item supply")?;

        Ok(())
    }

    /// Items the token indexer should work on next, oldest first.
    pub async fn fetch_pending_items(
        &self,
        retry_limit: u32,
        batch: u32,
    ) -> Result<Vec<ItemRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            {ITEM_COLUMNS}
            WHERE indexer_state NOT IN ('done', 'invalid')
              AND indexer_retry_count < ?
              AND is_appropriate = 1
            ORDER BY updated_at ASC
            LIMIT ?
            "#
        ))
        .bind(retry_limit as i64)
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_item).collect()
    }

    /// Persist metadata fields and pipeline state after an indexing step.
    pub async fn save_item_indexing(&self, item: &ItemRecord, now: i64) -> Result<()> {
        let attributes_json =
            serde_json::to_string(&item.attributes).context("Failed to serialize attributes")?;

        sqlx::query(
            r#"
            UPDATE nft_items
            SET token_uri = ?,
                image_url = ?,
                hosted_token_uri = ?,
                hosted_image_url = ?,
                thumbnail_path = ?,
                animation_url = ?,
                hosted_animation_url = ?,
                mime_type = ?,
                content_type = ?,
                attributes = ?,
                indexer_state = ?,
                indexer_retry_count = ?,
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(&item.token_uri)
        .bind(&item.image_url)
        .bind(&item.hosted_token_uri)
        .bind(&item.hosted_image_url)
        .bind(&item.thumbnail_path)
        .bind(&item.animation_url)
        .bind(&item.hosted_animation_url)
        .bind(&item.mime_type)
        .bind(&item.content_type)
        .bind(attributes_json)
        .bind(item.indexer_state.as_str())
        .bind(item.indexer_retry_count as i64)
        .bind(now)
        .bind(item.chain_id as i64)
        .bind(lowercase_address(&item.contract))
        .bind(item.token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save item indexing state")?;

        Ok(())
    }

    /// Bump the retry counter after a failed indexing step, flipping the item
    /// to `invalid` once the limit is exhausted.
    pub async fn record_indexer_failure(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        retry_limit: u32,
        now: i64,
    ) -> Result<IndexerState> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET indexer_retry_count = indexer_retry_count + 1,
                indexer_state = CASE
                    WHEN indexer_retry_count + 1 >= ? THEN 'invalid'
                    ELSE indexer_state
                END,
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(retry_limit as i64)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record indexer failure")?;

        let state: String = sqlx::query_scalar(
            "SELECT indexer_state FROM nft_items WHERE chain_id = ? AND contract = ? AND token_id = ?",
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(IndexerState::from_str(&state)?)
    }

    /// Queue a finished or parked item for metadata re-fetch.
    ///
    /// `done` and `invalid` items flip to `new_refreshing`; in-flight
    /// items keep going.
    pub async fn request_item_refresh(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE nft_items
            SET indexer_state = 'new_refreshing',
                indexer_retry_count = 0,
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
              AND indexer_state IN ('done', 'invalid')
            "#,
        )
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to request item refresh")?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace the price projection of an item.
    pub async fn update_item_price(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        price: &PriceProjection,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET price = ?,
                payment_token = ?,
                price_in_usd = ?,
                price_source = ?,
                instant_liquidity_usd = ?,
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(price.price)
        .bind(&price.payment_token)
        .bind(price.price_in_usd)
        .bind(price.price_source.as_str())
        .bind(price.instant_liquidity_usd)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update item price")?;

        Ok(())
    }

    /// Replace the listing/offer projection of an item.
    pub async fn update_item_listing_state(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        listing: &ListingProjection,
        now: i64,
    ) -> Result<()> {
        let listing_owners = serde_json::to_string(&listing.listing_owners)?;
        let inactive_listing_owners = serde_json::to_string(&listing.inactive_listing_owners)?;
        let offer_owners = serde_json::to_string(&listing.offer_owners)?;

        sqlx::query(
            r#"
            UPDATE nft_items
            SET has_order = ?,
                has_active_listings = ?,
                listing_ends_at = ?,
                listing_owners = ?,
                inactive_listing_owners = ?,
                offer_starts_at = ?,
                offer_ends_at = ?,
                offer_owners = ?,
                listed_at = COALESCE(?, listed_at),
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(listing.has_order)
        .bind(listing.has_active_listings)
        .bind(listing.listing_ends_at)
        .bind(listing_owners)
        .bind(inactive_listing_owners)
        .bind(listing.offer_starts_at)
        .bind(listing.offer_ends_at)
        .bind(offer_owners)
        .bind(listing.listed_at)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update item listing state")?;

        Ok(())
    }

    /// Record a sale against an item.
    pub async fn record_item_sale(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        price_in_native: f64,
        price_in_usd: f64,
        payment_token: &str,
        time: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET last_sale_price = ?,
                last_sale_price_usd = ?,
                last_sale_payment_token = ?,
                sold_at = ?,
                updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(price_in_native)
        .bind(price_in_usd)
        .bind(payment_token)
        .bind(time)
        .bind(time)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record item sale")?;

        Ok(())
    }

    /// Store a computed rarity rank/score for an item.
    pub async fn set_item_rarity(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        rank: u64,
        score: f64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nft_items
            SET openrarity_rank = ?, openrarity_score = ?, updated_at = ?
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(rank as i64)
        .bind(score)
        .bind(now)
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to set item rarity")?;

        Ok(())
    }

    /// Number of items in a collection.
    pub async fn count_items(&self, chain_id: u64, contract: &Address) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nft_items WHERE chain_id = ? AND contract = ?",
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Distinct single-token owners of a collection.
    pub async fn count_distinct_item_owners(
        &self,
        chain_id: u64,
        contract: &Address,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT owner) FROM nft_items
            WHERE chain_id = ? AND contract = ? AND owner != ''
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// One page of `(token_id, attributes)` pairs, ordered by insertion.
    pub async fn list_item_attributes_page(
        &self,
        chain_id: u64,
        contract: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<(U256, Vec<Attribute>)>> {
        let rows = sqlx::query(
            r#"
            SELECT token_id, attributes FROM nft_items
            WHERE chain_id = ? AND contract = ?
            ORDER BY rowid
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let token_id: String = row.get("token_id");
                let attributes: String = row.get("attributes");
                let token_id = token_id
                    .parse::<U256>()
                    .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?;
                let attributes: Vec<Attribute> = serde_json::from_str(&attributes)
                    .context("Invalid attributes in database")?;
                Ok((token_id, attributes))
            })
            .collect()
    }

    fn row_to_item(row: sqlx::sqlite::SqliteRow) -> Result<ItemRecord> {
        let contract: String = row.get("contract");
        let token_id: String = row.get("token_id");
        let token_type: String = row.get("token_type");
        let attributes: String = row.get("attributes");
        let price_source: String = row.get("price_source");
        let indexer_state: String = row.get("indexer_state");
        let listing_owners: String = row.get("listing_owners");
        let inactive_listing_owners: String = row.get("inactive_listing_owners");
        let offer_owners: String = row.get("offer_owners");

        Ok(ItemRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            contract: parse_address(&contract)?,
            token_id: token_id
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?,
            token_type: TokenType::from_str(&token_type)?,
            owner: row.get("owner"),
            token_uri: row.get("token_uri"),
            image_url: row.get("image_url"),
            hosted_token_uri: row.get("hosted_token_uri"),
            hosted_image_url: row.get("hosted_image_url"),
            thumbnail_path: row.get("thumbnail_path"),
            animation_url: row.get("animation_url"),
            hosted_animation_url: row.get("hosted_animation_url"),
            mime_type: row.get("mime_type"),
            content_type: row.get("content_type"),
            attributes: serde_json::from_str(&attributes)
                .context("Invalid attributes in database")?,
            price: row.get("price"),
            payment_token: row.get("payment_token"),
            price_in_usd: row.get("price_in_usd"),
            price_source: PriceSource::from_str(&price_source)?,
            instant_liquidity_usd: row.get("instant_liquidity_usd"),
            has_order: row.get("has_order"),
            has_active_listings: row.get("has_active_listings"),
            listing_ends_at: row.get("listing_ends_at"),
            listing_owners: serde_json::from_str(&listing_owners)
                .context("Invalid listing owners in database")?,
            inactive_listing_owners: serde_json::from_str(&inactive_listing_owners)
                .context("Invalid inactive listing owners in database")?,
            offer_starts_at: row.get("offer_starts_at"),
            offer_ends_at: row.get("offer_ends_at"),
            offer_owners: serde_json::from_str(&offer_owners)
                .context("Invalid offer owners in database")?,
            indexer_state: IndexerState::from_str(&indexer_state)?,
            indexer_retry_count: row.get::<i64, _>("indexer_retry_count") as u32,
            is_appropriate: row.get("is_appropriate"),
            is_filtered: row.get("is_filtered"),
            supply: row.get::<i64, _>("supply") as u64,
            num_owners: row.get::<i64, _>("num_owners") as u64,
            openrarity_rank: row
                .get::<Option<i64>, _>("openrarity_rank")
                .map(|v| v as u64),
            openrarity_score: row.get("openrarity_score"),
            last_sale_price: row.get("last_sale_price"),
            last_sale_price_usd: row.get("last_sale_price_usd"),
            last_sale_payment_token: row.get("last_sale_payment_token"),
            sold_at: row.get("sold_at"),
            listed_at: row.get("listed_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

const ITEM_COLUMNS: &str = r#"
    SELECT chain_id, contract, token_id, token_type, owner,
           token_uri, image_url, hosted_token_uri, hosted_image_url,
           thumbnail_path, animation_url, hosted_animation_url,
           mime_type, content_type, attributes,
           price, payment_token, price_in_usd, price_source, instant_liquidity_usd,
           has_order, has_active_listings, listing_ends_at,
           listing_owners, inactive_listing_owners,
           offer_starts_at, offer_ends_at, offer_owners,
           indexer_state, indexer_retry_count,
           is_appropriate, is_filtered, supply, num_owners,
           openrarity_rank, openrarity_score,
           last_sale_price, last_sale_price_usd, last_sale_payment_token,
           sold_at, listed_at, created_at, updated_at
    FROM nft_items
"#;
