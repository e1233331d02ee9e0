//! ERC-721 transfer handler.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use nfttrack_core::{lowercase_address, ActivityKind, ItemId, TokenType};
use tracing::{debug, warn};

use super::{EventHandler, LogEnvelope};
use crate::orderbook::OrderBook;
use crate::storage::{ActivityRecord, Storage};

sol! {
    /// Standard ERC-721 transfer event (all three fields indexed).
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
}

/// Side channel for ownership changes.
///
/// Carries the item into whatever follows a transfer outside the
/// indexer itself (user-facing galleries and the like). Failures are
/// logged, never propagated; chain state stays the source of truth.
#[async_trait]
pub trait OwnershipObserver: Send + Sync {
    /// Called after the item's owner row has been updated.
    async fn owner_changed(
        &self,
        chain_id: u64,
        contract: Address,
        token_id: U256,
        new_owner: Address,
    ) -> Result<()>;
}

/// Reducer for one tracked ERC-721 contract.
///
/// Keeps the item row, its owner and the activity journal in step with
/// transfers, then re-derives order validity and the listing/offer
/// projection of the moved token.
pub struct Erc721Handler {
    chain_id: u64,
    contract: Address,
    storage: Storage,
    orderbook: OrderBook,
    observer: Option<Arc<dyn OwnershipObserver>>,
}

impl Erc721Handler {
    /// Handler for `contract` on `chain_id`.
    pub fn new(chain_id: u64, contract: Address, storage: Storage, orderbook: OrderBook) -> Self {
        Self {
            chain_id,
            contract,
            storage,
            orderbook,
            observer: None,
        }
    }

    /// Attach an ownership observer.
    pub fn with_observer(mut self, observer: Arc<dyn OwnershipObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    async fn apply_transfer(
        &self,
        from: Address,
        to: Address,
        token_id: U256,
        envelope: &LogEnvelope,
    ) -> Result<()> {
        let now = envelope.block_time as i64;

        self.storage
            .ensure_collection(self.chain_id, &self.contract, TokenType::Erc721, now)
            .await?;
        let created = self
            .storage
            .ensure_item(self.chain_id, &self.contract, &token_id, TokenType::Erc721, now)
            .await?;
        if created {
            debug!(token_id = %token_id, contract = %self.contract, "new item discovered");
        }
        self.storage
            .set_item_owner(self.chain_id, &self.contract, &token_id, &to, now)
            .await?;

        if let Some(observer) = &self.observer {
            if let Err(err) = observer
                .owner_changed(self.chain_id, self.contract, token_id, to)
                .await
            {
                warn!(token_id = %token_id, "ownership observer failed: {err}");
            }
        }

        let kind = if from == Address::ZERO {
            ActivityKind::Mint
        } else {
            ActivityKind::Transfer
        };
        self.storage
            .insert_activity(&ActivityRecord {
                chain_id: self.chain_id,
                collection: self.contract,
                token_id,
                kind,
                account: lowercase_address(&from),
                to_account: lowercase_address(&to),
                quantity: 1,
                price: U256::ZERO,
                price_in_usd: 0.0,
                price_in_native: 0.0,
                block_number: Some(envelope.block_number()),
                tx_hash: envelope.tx_hash(),
                log_index: Some(envelope.log_index()),
                time: now,
                source: "chain".to_string(),
            })
            .await?;

        let id = ItemId::new(self.chain_id, self.contract, token_id);
        self.orderbook.refresh_orders(&id, now).await?;
        self.orderbook
            .refresh_listing_and_offer_state(&id, now)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Erc721Handler {
    fn name(&self) -> &str {
        "erc721"
    }

    fn topics(&self) -> Vec<B256> {
        vec![Transfer::SIGNATURE_HASH]
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let decoded = match Transfer::decode_log(&envelope.log.inner, true) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    block = envelope.block_number(),
                    log_index = envelope.log_index(),
                    "skipping undecodable transfer log: {err}"
                );
                return Ok(());
            }
        };

        let event = decoded.data;
        self.apply_transfer(event.from, event.to, event.tokenId, envelope)
            .await
    }

    async fn on_rewind(&self, from_block: u64) -> Result<()> {
        let deleted = self
            .storage
            .delete_chain_activity_from_block(self.chain_id, &self.contract, from_block)
            .await?;
        debug!(
            contract = %self.contract,
            from_block,
            deleted,
            "rewound transfer activity"
        );
        Ok(())
    }
}
