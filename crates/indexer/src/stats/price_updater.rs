//! Periodic order-state refresh.
//!
//! Time moves orders in and out of their validity windows without any
//! chain event firing, so a timer walks every token that has orders and
//! re-projects its listing and offer state onto the item row.

use anyhow::Result;
use nfttrack_core::ItemId;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PriceUpdaterConfig;
use crate::orderbook::OrderBook;
use crate::storage::Storage;

/// Timer-driven item price refresher.
pub struct PriceUpdater {
    chain_id: u64,
    storage: Storage,
    orderbook: OrderBook,
    config: PriceUpdaterConfig,
}

impl PriceUpdater {
    /// Build an updater for one chain.
    pub fn new(
        chain_id: u64,
        storage: Storage,
        orderbook: OrderBook,
        config: PriceUpdaterConfig,
    ) -> Self {
        Self {
            chain_id,
            storage,
            orderbook,
            config,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(interval_secs = self.config.interval_secs, "Price updater starting");
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Price updater stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_all().await {
                        warn!("Price refresh pass failed: {err:#}");
                    }
                }
            }
        }
    }

    /// Re-project every token that has order rows, live or not.
    pub async fn refresh_all(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for collection in self.storage.list_collections(self.chain_id).await? {
            let tokens = self
                .storage
                .list_tokens_with_orders(self.chain_id, &collection.address)
                .await?;
            for token_id in tokens {
                let item = ItemId::new(self.chain_id, collection.address, token_id);
                if let Err(err) = self
                    .orderbook
                    .refresh_listing_and_offer_state(&item, now)
                    .await
                {
                    warn!(
                        collection = %collection.address,
                        token_id = %token_id,
                        "Failed to refresh item prices: {err:#}"
                    );
                }
            }
        }
        Ok(())
    }
}
