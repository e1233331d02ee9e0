//! Timer-driven collection statistics.
//!
//! The refresher derives everything from storage: trait histograms,
//! supply and owner counts, floor prices from the live order book, and
//! a daily floor-price history row. Rarity ranks are recomputed only
//! when the trait histogram hash changes.

use alloy::primitives::keccak256;
use anyhow::{Context, Result};
use nfttrack_core::constants::OPENRARITY_PAGE_SIZE;
use nfttrack_core::{OrderStrategy, TokenType, TradingPeriod};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsConfig;
use crate::storage::{CollectionRecord, FloorPriceRecord, Storage};

pub mod price_updater;
pub mod rarity;

pub use price_updater::PriceUpdater;

/// Periodic per-collection stat refresher.
pub struct StatRefresher {
    chain_id: u64,
    storage: Storage,
    config: StatsConfig,
}

impl StatRefresher {
    /// Build a refresher for one chain.
    pub fn new(chain_id: u64, storage: Storage, config: StatsConfig) -> Self {
        Self {
            chain_id,
            storage,
            config,
        }
    }

    /// Run until cancelled, refreshing every collection per tick.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(interval_secs = self.config.interval_secs, "Stat refresher starting");
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Stat refresher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_all().await {
                        warn!("Stat refresh pass failed: {err:#}");
                    }
                }
            }
        }
    }

    /// One pass over every tracked collection. A failing collection is
    /// logged and skipped so the rest still refresh.
    pub async fn refresh_all(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for collection in self.storage.list_collections(self.chain_id).await? {
            if !collection.is_appropriate {
                continue;
            }
            if let Err(err) = self.refresh_collection(&collection, now).await {
                warn!(
                    collection = %collection.address,
                    "Failed to refresh collection stats: {err:#}"
                );
            }
        }
        Ok(())
    }

    /// Recompute one collection's derived stats.
    pub async fn refresh_collection(
        &self,
        collection: &CollectionRecord,
        now: i64,
    ) -> Result<()> {
        let address = &collection.address;

        // Page the full trait inventory once; the histogram, trait
        // floors and rarity pass all read from it.
        let mut items = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = self
                .storage
                .list_item_attributes_page(self.chain_id, address, offset, OPENRARITY_PAGE_SIZE)
                .await?;
            let fetched = page.len() as u64;
            items.extend(page);
            if fetched < OPENRARITY_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        let mut histogram = rarity::TraitHistogram::new();
        for (_, attributes) in &items {
            for attribute in attributes {
                *histogram
                    .entry(attribute.trait_type.clone())
                    .or_default()
                    .entry(attribute.value.clone())
                    .or_default() += 1;
            }
        }

        let supply = self.storage.count_items(self.chain_id, address).await?;
        let num_owners = match collection.token_type {
            TokenType::Erc1155 => {
                self.storage
                    .collection_holder_count(self.chain_id, address)
                    .await?
            }
            _ => {
                self.storage
                    .count_distinct_item_owners(self.chain_id, address)
                    .await?
            }
        };

        let serialized =
            serde_json::to_vec(&histogram).context("Failed to serialize trait histogram")?;
        let attributes_hash = hex::encode(keccak256(&serialized));
        let rarity_stale = !histogram.is_empty() && attributes_hash != collection.attributes_hash;

        self.storage
            .update_collection_stats(
                self.chain_id,
                address,
                supply,
                num_owners,
                &histogram,
                &attributes_hash,
                rarity_stale,
                now,
            )
            .await?;

        if rarity_stale {
            debug!(collection = %address, supply, "Trait histogram changed, reranking");
            for (token_id, rank, score) in rarity::rank(&items, &histogram, supply) {
                self.storage
                    .set_item_rarity(self.chain_id, address, &token_id, rank, score, now)
                    .await?;
            }
        }

        self.refresh_floor(collection, &items, num_owners, now).await
    }

    /// Floor and trait floors from live fixed-price asks, plus the
    /// daily history sample.
    async fn refresh_floor(
        &self,
        collection: &CollectionRecord,
        items: &[(alloy::primitives::U256, Vec<nfttrack_core::Attribute>)],
        num_owners: u64,
        now: i64,
    ) -> Result<()> {
        let address = &collection.address;
        let listings = self
            .storage
            .list_live_listings_for_collection(self.chain_id, address, now)
            .await?;

        let attributes_by_token: HashMap<_, _> = items
            .iter()
            .map(|(token_id, attributes)| (*token_id, attributes))
            .collect();

        let mut floor: Option<(f64, f64)> = None;
        let mut trait_floor: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        // Listings arrive cheapest-first; private sales and offers do
        // not set the floor.
        for listing in listings
            .iter()
            .filter(|listing| listing.strategy_kind == OrderStrategy::FixedPrice)
        {
            if floor.is_none() {
                floor = Some((listing.price_in_native, listing.price_in_usd));
            }
            if let Some(attributes) = attributes_by_token.get(&listing.token_id) {
                for attribute in attributes.iter() {
                    let slot = trait_floor
                        .entry(attribute.trait_type.clone())
                        .or_default()
                        .entry(attribute.value.clone())
                        .or_insert(listing.price_in_native);
                    if listing.price_in_native < *slot {
                        *slot = listing.price_in_native;
                    }
                }
            }
        }

        let (floor_native, floor_usd) = floor.unwrap_or((0.0, 0.0));
        self.storage
            .update_collection_floor(
                self.chain_id,
                address,
                floor_native,
                floor_usd,
                &trait_floor,
                now,
            )
            .await?;

        // Marketplace mirror prices ride along unchanged; they are only
        // written when an external feed supplies them.
        self.storage
            .upsert_floor_price(&FloorPriceRecord {
                chain_id: self.chain_id,
                address: *address,
                date: TradingPeriod::Day.truncate(now),
                price_in_native: floor_native,
                price_in_usd: floor_usd,
                num_owners,
                opensea_price_in_native: collection.opensea_floor_native,
                opensea_price_in_usd: collection.opensea_floor_usd,
            })
            .await
    }
}
