//! Exchange contract handler.
//!
//! Three event families: nonce-wide cancels, per-hash cancels, and
//! fills (`TakerAsk` when a taker sells into a maker bid, `TakerBid`
//! when a taker buys a maker ask). Fills consume the order item
//! silently and write the sale everywhere it is denormalized: activity
//! journal, collection aggregates, trading volume and the item itself.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use nfttrack_core::{lowercase_address, ActivityKind, ItemId, TokenType, TradingPeriod};
use tracing::{info, warn};

use super::{EventHandler, LogEnvelope};
use crate::orderbook::{ChainEventMeta, OrderBook, PriceQuote};
use crate::storage::{ActivityRecord, Storage};

sol! {
    /// A signer invalidated every nonce below `newMinNonce`.
    event CancelAllOrders(address indexed user, uint256 newMinNonce);

    /// A signer cancelled specific order items.
    event CancelMultipleOrders(address indexed user, bytes32[] orderItemHashes);

    /// A taker filled a maker bid (taker is the seller).
    event TakerAsk(
        bytes32 orderItemHash,
        uint256 orderNonce,
        address indexed taker,
        address indexed maker,
        address indexed strategy,
        address currency,
        address collection,
        uint256 tokenId,
        uint256 amount,
        uint256 price
    );

    /// A taker filled a maker ask (taker is the buyer).
    event TakerBid(
        bytes32 orderItemHash,
        uint256 orderNonce,
        address indexed taker,
        address indexed maker,
        address indexed strategy,
        address currency,
        address collection,
        uint256 tokenId,
        uint256 amount,
        uint256 price
    );
}

/// Fields shared by the two fill events.
struct Fill {
    order_item_hash: B256,
    seller: Address,
    buyer: Address,
    currency: Address,
    collection: Address,
    token_id: U256,
    amount: u64,
    price: U256,
}

/// Reducer for the exchange contract.
pub struct ExchangeHandler {
    chain_id: u64,
    storage: Storage,
    orderbook: OrderBook,
}

impl ExchangeHandler {
    /// Handler for the exchange on `chain_id`.
    pub fn new(chain_id: u64, storage: Storage, orderbook: OrderBook) -> Self {
        Self {
            chain_id,
            storage,
            orderbook,
        }
    }

    fn meta(envelope: &LogEnvelope) -> ChainEventMeta {
        ChainEventMeta {
            block_number: envelope.block_number(),
            tx_hash: envelope.tx_hash().unwrap_or_default(),
            log_index: envelope.log_index(),
            time: envelope.block_time as i64,
        }
    }

    async fn handle_cancel_all(
        &self,
        user: Address,
        new_min_nonce: u64,
        envelope: &LogEnvelope,
    ) -> Result<()> {
        let now = envelope.block_time as i64;
        info!(%user, new_min_nonce, "cancel-all orders");

        self.storage
            .set_min_valid_order_nonce(self.chain_id, &user, new_min_nonce)
            .await?;
        // availableNonce >= newMinNonce afterwards.
        if new_min_nonce > 0 {
            self.storage
                .bump_available_nonce(self.chain_id, &user, new_min_nonce - 1)
                .await?;
        }

        let meta = Self::meta(envelope);
        self.orderbook
            .cancel_by_nonce(&user, new_min_nonce, Some(&meta), now)
            .await?;
        Ok(())
    }

    async fn handle_cancel_multiple(
        &self,
        hashes: &[B256],
        envelope: &LogEnvelope,
    ) -> Result<()> {
        let now = envelope.block_time as i64;
        let meta = Self::meta(envelope);
        self.orderbook
            .cancel_by_item_hashes(hashes, Some(&meta), now)
            .await?;
        Ok(())
    }

    async fn handle_fill(&self, fill: Fill, envelope: &LogEnvelope) -> Result<()> {
        let now = envelope.block_time as i64;

        // The filled item is consumed without a cancel activity; the
        // sale entry below is the record of what happened.
        self.orderbook
            .cancel_by_item_hashes(&[fill.order_item_hash], None, now)
            .await?;

        let token_type = self
            .storage
            .get_collection(self.chain_id, &fill.collection)
            .await?
            .map(|c| c.token_type)
            .unwrap_or(TokenType::Erc721);
        self.storage
            .ensure_collection(self.chain_id, &fill.collection, token_type, now)
            .await?;
        self.storage
            .ensure_item(self.chain_id, &fill.collection, &fill.token_id, token_type, now)
            .await?;

        let quote = self
            .orderbook
            .formatter()
            .quote(&fill.currency, &fill.price)
            .unwrap_or(PriceQuote {
                display: 0.0,
                in_usd: 0.0,
                in_native: 0.0,
            });

        // The sale row's unique key doubles as the re-delivery check;
        // the volume and aggregate writes below are not idempotent and
        // must only run for first-seen fills.
        let first_seen = self
            .storage
            .insert_activity(&ActivityRecord {
                chain_id: self.chain_id,
                collection: fill.collection,
                token_id: fill.token_id,
                kind: ActivityKind::Sale,
                account: lowercase_address(&fill.seller),
                to_account: lowercase_address(&fill.buyer),
                quantity: fill.amount,
                price: fill.price,
                price_in_usd: quote.in_usd,
                price_in_native: quote.in_native,
                block_number: Some(envelope.block_number()),
                tx_hash: envelope.tx_hash(),
                log_index: Some(envelope.log_index()),
                time: now,
                source: "chain".to_string(),
            })
            .await?;
        if !first_seen {
            return Ok(());
        }

        self.storage
            .record_collection_sale(self.chain_id, &fill.collection, quote.in_native, now)
            .await?;

        for period in [TradingPeriod::Day, TradingPeriod::All] {
            self.storage
                .add_trading_volume(
                    self.chain_id,
                    &fill.collection,
                    period,
                    period.truncate(now),
                    quote.in_native,
                    quote.in_usd,
                )
                .await?;
        }

        self.storage
            .record_item_sale(
                self.chain_id,
                &fill.collection,
                &fill.token_id,
                quote.in_native,
                quote.in_usd,
                &lowercase_address(&fill.currency),
                now,
            )
            .await?;

        let id = ItemId::new(self.chain_id, fill.collection, fill.token_id);
        self.orderbook
            .refresh_listing_and_offer_state(&id, now)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ExchangeHandler {
    fn name(&self) -> &str {
        "exchange"
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            CancelAllOrders::SIGNATURE_HASH,
            CancelMultipleOrders::SIGNATURE_HASH,
            TakerAsk::SIGNATURE_HASH,
            TakerBid::SIGNATURE_HASH,
        ]
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let topic0 = match envelope.log.inner.topics().first() {
            Some(topic) => *topic,
            None => return Ok(()),
        };

        if topic0 == CancelAllOrders::SIGNATURE_HASH {
            match CancelAllOrders::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    self.handle_cancel_all(event.user, event.newMinNonce.saturating_to(), envelope)
                        .await
                }
                Err(err) => {
                    warn!("skipping undecodable CancelAllOrders log: {err}");
                    Ok(())
                }
            }
        } else if topic0 == CancelMultipleOrders::SIGNATURE_HASH {
            match CancelMultipleOrders::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    self.handle_cancel_multiple(&decoded.data.orderItemHashes, envelope)
                        .await
                }
                Err(err) => {
                    warn!("skipping undecodable CancelMultipleOrders log: {err}");
                    Ok(())
                }
            }
        } else if topic0 == TakerAsk::SIGNATURE_HASH {
            match TakerAsk::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    self.handle_fill(
                        Fill {
                            order_item_hash: event.orderItemHash,
                            seller: event.taker,
                            buyer: event.maker,
                            currency: event.currency,
                            collection: event.collection,
                            token_id: event.tokenId,
                            amount: event.amount.saturating_to(),
                            price: event.price,
                        },
                        envelope,
                    )
                    .await
                }
                Err(err) => {
                    warn!("skipping undecodable TakerAsk log: {err}");
                    Ok(())
                }
            }
        } else if topic0 == TakerBid::SIGNATURE_HASH {
            match TakerBid::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    self.handle_fill(
                        Fill {
                            order_item_hash: event.orderItemHash,
                            seller: event.maker,
                            buyer: event.taker,
                            currency: event.currency,
                            collection: event.collection,
                            token_id: event.tokenId,
                            amount: event.amount.saturating_to(),
                            price: event.price,
                        },
                        envelope,
                    )
                    .await
                }
                Err(err) => {
                    warn!("skipping undecodable TakerBid log: {err}");
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }

    async fn on_rewind(&self, from_block: u64) -> Result<()> {
        self.storage
            .delete_exchange_activity_from_block(self.chain_id, from_block)
            .await?;
        Ok(())
    }
}
