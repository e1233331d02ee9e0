//! Order-book core.
//!
//! Validates signed maker orders (EIP-712, with an EIP-1271 fallback for
//! contract wallets), persists the order and its per-item projections,
//! cancels by item hash or nonce, and recomputes the denormalized
//! listing/offer/price view of a token whenever orders may have changed.
//!
//! The projections written here are views: pure functions of the current
//! order rows and holdings, recomputed wholesale by the `refresh_*` entry
//! points and never patched incrementally.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use nfttrack_core::hashing::{
    decode_reserved_buyer, hash_order, hash_order_item, recover_order_signer, MakerOrder,
    OrderItem as OrderItemAbi,
};
use nfttrack_core::{lowercase_address, ActivityKind, ItemId, OrderStrategy, PriceSource, TokenType};

use crate::config::{ContractsConfig, PayTokenConfig};
use crate::rpc::{call_request, ThrottledClient};
use crate::storage::items::{ListingProjection, PriceProjection};
use crate::storage::{ActivityRecord, OrderItemRecord, OrderRecord, Storage};

pub mod pricing;

pub use pricing::{PriceFormatter, PriceQuote};

sol! {
    /// EIP-1271 contract-wallet signature check.
    interface IERC1271 {
        function isValidSignature(bytes32 hash, bytes signature) external view returns (bytes4);
    }
}

/// Magic return value of a successful `isValidSignature` call.
const ERC1271_MAGIC: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

/// Why an order was rejected.
///
/// None of these is fatal to the engine; they surface to whoever
/// submitted the order.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Nonce below the signer's cancel-all cutoff.
    #[error("order nonce {nonce} is below the minimum valid nonce {min}")]
    InvalidNonce {
        /// Submitted nonce.
        nonce: u64,
        /// Current `minValidOrderNonce` of the signer.
        min: u64,
    },

    /// The strategy contract is not one the exchange knows.
    #[error("unknown strategy contract {0}")]
    UnknownStrategy(Address),

    /// Strategy/side mismatch (private sales must be asks, collection
    /// offers must be bids).
    #[error("strategy {strategy} does not allow {side} orders")]
    InvalidSide {
        /// The submitted strategy.
        strategy: OrderStrategy,
        /// "ask" or "bid".
        side: &'static str,
    },

    /// Another order with the same signer and nonce already exists.
    #[error("an order with nonce {0} already exists for this signer")]
    DuplicateNonce(u64),

    /// Neither EOA recovery nor EIP-1271 accepted the signature.
    #[error("order signature is invalid")]
    InvalidSignature,

    /// The currency is not a configured pay token.
    #[error("currency {0} is not an accepted pay token")]
    UnknownCurrency(Address),

    /// An order without items is meaningless.
    #[error("order has no items")]
    EmptyOrder,

    /// Everything else (storage, RPC) while placing.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// One item of an incoming maker order.
#[derive(Debug, Clone)]
pub struct OrderItemInput {
    /// Collection contract.
    pub collection: Address,
    /// Token id; zero for collection offers.
    pub token_id: U256,
    /// Quantity (1 for 721/punk).
    pub amount: u64,
    /// Raw wei price in the order currency.
    pub price: U256,
}

/// A signed maker order as submitted for placement.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    /// True for a sell order.
    pub is_ask: bool,
    /// Maker address.
    pub signer: Address,
    /// The order's items.
    pub items: Vec<OrderItemInput>,
    /// Strategy contract address.
    pub strategy: Address,
    /// Pay-token contract address.
    pub currency: Address,
    /// Maker nonce.
    pub nonce: u64,
    /// Start of validity window, unix seconds.
    pub start_time: i64,
    /// End of validity window, unix seconds.
    pub end_time: i64,
    /// Royalty slippage floor, basis points.
    pub min_percentage_to_ask: u64,
    /// Originating marketplace label.
    pub marketplace: String,
    /// ABI-encoded strategy params.
    pub params: Bytes,
    /// Signature `v` (27/28 or 0/1).
    pub sig_v: u8,
    /// Signature `r`.
    pub sig_r: B256,
    /// Signature `s`.
    pub sig_s: B256,
    /// Fee distribution label, carried through to storage.
    pub fee_dist_type: String,
}

/// Chain coordinates of the log that caused a cancel/fill.
///
/// Attached to the cancel activities so the feed orders correctly.
#[derive(Debug, Clone, Copy)]
pub struct ChainEventMeta {
    /// Block containing the event.
    pub block_number: u64,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// Block timestamp, unix seconds.
    pub time: i64,
}

/// Verifies contract-wallet signatures (EIP-1271).
///
/// Split out as a trait so order placement is testable without a node.
#[async_trait]
pub trait SignatureChecker: Send + Sync {
    /// True when `signer` accepts `signature` over `digest`.
    async fn is_valid_contract_signature(
        &self,
        signer: Address,
        digest: B256,
        signature: &[u8],
    ) -> Result<bool>;
}

/// [`SignatureChecker`] backed by `eth_call` through the throttled client.
pub struct Erc1271Checker {
    client: ThrottledClient,
}

impl Erc1271Checker {
    /// Wrap a throttled client.
    pub fn new(client: ThrottledClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignatureChecker for Erc1271Checker {
    async fn is_valid_contract_signature(
        &self,
        signer: Address,
        digest: B256,
        signature: &[u8],
    ) -> Result<bool> {
        let call = IERC1271::isValidSignatureCall {
            hash: digest,
            signature: Bytes::copy_from_slice(signature),
        };
        let request = call_request(signer, call.abi_encode().into());
        let returned = match self.client.call(&request).await {
            Ok(bytes) => bytes,
            // A revert (EOA target, non-1271 contract) is a plain "no".
            Err(err) => {
                debug!(%signer, "isValidSignature call failed: {err:#}");
                return Ok(false);
            }
        };
        Ok(returned.len() >= 4 && returned[..4] == ERC1271_MAGIC)
    }
}

/// The order-book core.
///
/// Cloning is cheap; clones share storage and the signature checker.
#[derive(Clone)]
pub struct OrderBook {
    chain_id: u64,
    exchange: Address,
    strategies: HashMap<Address, OrderStrategy>,
    storage: Storage,
    formatter: PriceFormatter,
    signatures: Arc<dyn SignatureChecker>,
}

impl OrderBook {
    /// Build the order book for one chain.
    pub fn new(
        chain_id: u64,
        contracts: &ContractsConfig,
        pay_tokens: &[PayTokenConfig],
        storage: Storage,
        signatures: Arc<dyn SignatureChecker>,
    ) -> Self {
        let strategies = HashMap::from([
            (contracts.strategy_fixed_price, OrderStrategy::FixedPrice),
            (contracts.strategy_private_sale, OrderStrategy::PrivateSale),
            (
                contracts.strategy_collection_offer,
                OrderStrategy::CollectionOffer,
            ),
        ]);
        Self {
            chain_id,
            exchange: contracts.exchange,
            strategies,
            storage,
            formatter: PriceFormatter::new(pay_tokens),
            signatures,
        }
    }

    /// The price formatter, shared with handlers that quote fills.
    pub fn formatter(&self) -> &PriceFormatter {
        &self.formatter
    }

    /// Validate and persist a maker order.
    ///
    /// Returns the EIP-712 order hash. Any failure after the first row
    /// write rolls back the order and all of its items.
    pub async fn place_order(
        &self,
        request: &PlaceOrderRequest,
        now: i64,
    ) -> Result<B256, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }

        let maker = to_maker_order(request);
        let order_hash = hash_order(&maker, self.chain_id, self.exchange);

        let nonces = self
            .storage
            .get_nonce_record(self.chain_id, &request.signer)
            .await?;
        if request.nonce < nonces.min_valid_order_nonce {
            return Err(OrderError::InvalidNonce {
                nonce: request.nonce,
                min: nonces.min_valid_order_nonce,
            });
        }

        let strategy_kind = *self
            .strategies
            .get(&request.strategy)
            .ok_or(OrderError::UnknownStrategy(request.strategy))?;
        if !strategy_kind.allows_side(request.is_ask) {
            return Err(OrderError::InvalidSide {
                strategy: strategy_kind,
                side: if request.is_ask { "ask" } else { "bid" },
            });
        }

        if self
            .storage
            .has_order_with_nonce(self.chain_id, &request.signer, request.nonce)
            .await?
        {
            return Err(OrderError::DuplicateNonce(request.nonce));
        }

        self.verify_signature(request, order_hash).await?;

        if self.formatter.pay_token(&request.currency).is_none() {
            return Err(OrderError::UnknownCurrency(request.currency));
        }

        if let Err(err) = self
            .write_order(request, &maker, order_hash, strategy_kind, now)
            .await
        {
            warn!(%order_hash, "order placement failed, rolling back: {err:#}");
            self.storage.delete_order(self.chain_id, &order_hash).await?;
            return Err(OrderError::Internal(err));
        }

        Ok(order_hash)
    }

    /// Cancel order items by their exchange-side hashes.
    ///
    /// With `meta`, a cancel activity is written per open item (the
    /// on-chain `CancelMultipleOrders` path); without, items are marked
    /// used silently (the fill path). Affected tokens are re-projected.
    pub async fn cancel_by_item_hashes(
        &self,
        hashes: &[B256],
        meta: Option<&ChainEventMeta>,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let affected = self
            .storage
            .cancel_order_items_by_hashes(self.chain_id, hashes)
            .await?;

        for item in &affected {
            if let Some(meta) = meta {
                self.write_cancel_activity(item, meta).await?;
            }
            self.refresh_token_after_order_change(item, now).await?;
        }
        Ok(affected)
    }

    /// Cancel every open order item of `signer` with `nonce < cutoff`.
    ///
    /// The on-chain `CancelAllOrders` path; one cancel activity per open
    /// item, then re-projection of the touched tokens.
    pub async fn cancel_by_nonce(
        &self,
        signer: &Address,
        cutoff: u64,
        meta: Option<&ChainEventMeta>,
        now: i64,
    ) -> Result<Vec<OrderItemRecord>> {
        let affected = self
            .storage
            .cancel_order_items_below_nonce(self.chain_id, signer, cutoff)
            .await?;

        for item in &affected {
            if let Some(meta) = meta {
                self.write_cancel_activity(item, meta).await?;
            }
            self.refresh_token_after_order_change(item, now).await?;
        }
        Ok(affected)
    }

    /// Recompute `is_valid` and the stored prices of every active ask on
    /// a token from the current owner/holdings.
    ///
    /// Called after any transfer; offers stay valid until used.
    pub async fn refresh_orders(&self, item: &ItemId, now: i64) -> Result<()> {
        let Some(record) = self
            .storage
            .get_item(item.chain_id, &item.contract, &item.token_id)
            .await?
        else {
            return Ok(());
        };

        let asks = self
            .storage
            .list_active_asks_for_token(self.chain_id, &item.contract, &item.token_id, now)
            .await?;

        for ask in asks {
            let valid = match record.token_type {
                TokenType::Erc721 | TokenType::Punk => {
                    record.owner == lowercase_address(&ask.signer)
                }
                TokenType::Erc1155 => {
                    let held = self
                        .storage
                        .get_holding(self.chain_id, &item.contract, &item.token_id, &ask.signer)
                        .await?
                        .map(|h| h.balance)
                        .unwrap_or(0);
                    held >= ask.amount
                }
            };
            if valid != ask.is_valid {
                self.storage
                    .set_order_item_validity(self.chain_id, &ask.order_hash, ask.item_idx, valid)
                    .await?;
            }

            if let Some(quote) = self.formatter.quote(&ask.currency, &ask.price) {
                let changed = quote.display != ask.display_price
                    || quote.in_usd != ask.price_in_usd
                    || quote.in_native != ask.price_in_native;
                if changed {
                    self.storage
                        .set_order_item_prices(
                            self.chain_id,
                            &ask.order_hash,
                            ask.item_idx,
                            quote.display,
                            quote.in_usd,
                            quote.in_native,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Recompute the listing/offer and price projections of a token.
    pub async fn refresh_listing_and_offer_state(&self, item: &ItemId, now: i64) -> Result<()> {
        self.project(item, now, None).await
    }

    async fn refresh_token_after_order_change(
        &self,
        item: &OrderItemRecord,
        now: i64,
    ) -> Result<()> {
        // Collection offers carry no real token id; there is nothing to
        // re-project until a per-token refresh runs.
        if item.strategy_kind == OrderStrategy::CollectionOffer {
            return Ok(());
        }
        let id = ItemId::new(self.chain_id, item.collection, item.token_id);
        self.refresh_listing_and_offer_state(&id, now).await
    }

    async fn verify_signature(
        &self,
        request: &PlaceOrderRequest,
        order_hash: B256,
    ) -> Result<(), OrderError> {
        if let Ok(recovered) =
            recover_order_signer(order_hash, request.sig_v, request.sig_r, request.sig_s)
        {
            if recovered == request.signer {
                return Ok(());
            }
        }

        // Contract wallets sign through EIP-1271; pack r || s || v.
        let mut packed = [0u8; 65];
        packed[..32].copy_from_slice(request.sig_r.as_slice());
        packed[32..64].copy_from_slice(request.sig_s.as_slice());
        packed[64] = request.sig_v;
        let accepted = self
            .signatures
            .is_valid_contract_signature(request.signer, order_hash, &packed)
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(OrderError::InvalidSignature)
        }
    }

    async fn write_order(
        &self,
        request: &PlaceOrderRequest,
        maker: &MakerOrder,
        order_hash: B256,
        strategy_kind: OrderStrategy,
        now: i64,
    ) -> Result<()> {
        for (idx, input) in request.items.iter().enumerate() {
            let order_item_hash = hash_order_item(maker, idx)?;
            let quote = self
                .formatter
                .quote(&request.currency, &input.price)
                .unwrap_or(PriceQuote {
                    display: 0.0,
                    in_usd: 0.0,
                    in_native: 0.0,
                });
            let reserved_buyer = if strategy_kind == OrderStrategy::PrivateSale {
                decode_reserved_buyer(&request.params)
            } else {
                None
            };

            let is_valid = if request.is_ask {
                self.signer_holds(request, input).await?
            } else {
                true
            };

            self.storage
                .insert_order_item(&OrderItemRecord {
                    chain_id: self.chain_id,
                    order_hash,
                    item_idx: idx as u32,
                    order_item_hash,
                    hex_nonce: format!("{:#x}", request.nonce),
                    is_ask: request.is_ask,
                    signer: request.signer,
                    collection: input.collection,
                    token_id: input.token_id,
                    amount: input.amount,
                    price: input.price,
                    strategy: request.strategy,
                    strategy_kind,
                    currency: request.currency,
                    nonce: request.nonce,
                    start_time: request.start_time,
                    end_time: request.end_time,
                    display_price: quote.display,
                    price_in_usd: quote.in_usd,
                    price_in_native: quote.in_native,
                    reserved_buyer,
                    is_valid,
                    is_used: false,
                    marketplace: request.marketplace.clone(),
                    created_at: now,
                })
                .await?;

            if strategy_kind != OrderStrategy::CollectionOffer {
                let id = ItemId::new(self.chain_id, input.collection, input.token_id);
                let listed_at = request.is_ask.then_some(now);
                self.project(&id, now, listed_at).await?;
            }
            if request.is_ask {
                self.storage
                    .record_collection_listing(self.chain_id, &input.collection, now)
                    .await?;
            }

            self.storage
                .insert_activity(&ActivityRecord {
                    chain_id: self.chain_id,
                    collection: input.collection,
                    token_id: input.token_id,
                    kind: if request.is_ask {
                        ActivityKind::List
                    } else {
                        ActivityKind::Offer
                    },
                    account: lowercase_address(&request.signer),
                    to_account: String::new(),
                    quantity: input.amount,
                    price: input.price,
                    price_in_usd: quote.in_usd,
                    price_in_native: quote.in_native,
                    block_number: None,
                    tx_hash: None,
                    log_index: None,
                    time: now,
                    source: "orderbook".to_string(),
                })
                .await?;
        }

        self.storage
            .insert_order(&OrderRecord {
                chain_id: self.chain_id,
                order_hash,
                is_ask: request.is_ask,
                signer: request.signer,
                strategy: request.strategy,
                strategy_kind,
                currency: request.currency,
                nonce: request.nonce,
                start_time: request.start_time,
                end_time: request.end_time,
                min_percentage_to_ask: request.min_percentage_to_ask,
                marketplace: request.marketplace.clone(),
                params: format!("0x{}", hex::encode(&request.params)),
                sig_v: request.sig_v,
                sig_r: request.sig_r,
                sig_s: request.sig_s,
                fee_dist_type: request.fee_dist_type.clone(),
                created_at: now,
            })
            .await?;

        self.storage
            .bump_available_nonce(self.chain_id, &request.signer, request.nonce)
            .await?;

        Ok(())
    }

    async fn signer_holds(
        &self,
        request: &PlaceOrderRequest,
        input: &OrderItemInput,
    ) -> Result<bool> {
        let Some(record) = self
            .storage
            .get_item(self.chain_id, &input.collection, &input.token_id)
            .await?
        else {
            // Unknown token: accept and let the next transfer refresh it.
            return Ok(true);
        };
        Ok(match record.token_type {
            TokenType::Erc721 | TokenType::Punk => {
                record.owner == lowercase_address(&request.signer)
            }
            TokenType::Erc1155 => {
                let held = self
                    .storage
                    .get_holding(
                        self.chain_id,
                        &input.collection,
                        &input.token_id,
                        &request.signer,
                    )
                    .await?
                    .map(|h| h.balance)
                    .unwrap_or(0);
                held >= input.amount
            }
        })
    }

    async fn write_cancel_activity(
        &self,
        item: &OrderItemRecord,
        meta: &ChainEventMeta,
    ) -> Result<()> {
        self.storage
            .insert_activity(&ActivityRecord {
                chain_id: self.chain_id,
                collection: item.collection,
                token_id: item.token_id,
                kind: if item.is_ask {
                    ActivityKind::CancelListing
                } else {
                    ActivityKind::CancelOffer
                },
                account: lowercase_address(&item.signer),
                to_account: String::new(),
                quantity: item.amount,
                price: item.price,
                price_in_usd: item.price_in_usd,
                price_in_native: item.price_in_native,
                block_number: Some(meta.block_number),
                tx_hash: Some(meta.tx_hash),
                log_index: Some(meta.log_index),
                time: meta.time,
                source: "chain".to_string(),
            })
            .await?;
        Ok(())
    }

    /// Recompute and store both projections of one token.
    ///
    /// Collection offers on the same contract contribute to the offer
    /// fields and instant liquidity, but only token-specific orders feed
    /// the price tuple.
    async fn project(&self, item: &ItemId, now: i64, listed_at: Option<i64>) -> Result<()> {
        let asks = self
            .storage
            .list_active_asks_for_token(item.chain_id, &item.contract, &item.token_id, now)
            .await?;
        let offers = self
            .storage
            .list_active_offers_for_token(item.chain_id, &item.contract, &item.token_id, now)
            .await?;

        let valid_asks: Vec<&OrderItemRecord> = asks.iter().filter(|a| a.is_valid).collect();
        let invalid_asks: Vec<&OrderItemRecord> = asks.iter().filter(|a| !a.is_valid).collect();

        let listing = ListingProjection {
            has_order: !asks.is_empty() || !offers.is_empty(),
            has_active_listings: !valid_asks.is_empty(),
            listing_ends_at: valid_asks.iter().map(|a| a.end_time).max().unwrap_or(0),
            listing_owners: unique_signers(&valid_asks),
            inactive_listing_owners: unique_signers(&invalid_asks),
            offer_starts_at: offers.iter().map(|o| o.start_time).min().unwrap_or(0),
            offer_ends_at: offers.iter().map(|o| o.end_time).max().unwrap_or(0),
            offer_owners: unique_signers(&offers.iter().collect::<Vec<_>>()),
            listed_at,
        };

        let instant_liquidity_usd = offers
            .iter()
            .map(|o| o.price_in_usd)
            .fold(0.0f64, f64::max);

        // Cheapest valid listing wins; else the highest token-specific
        // offer. Both lists come back pre-sorted with the created-at and
        // hash tie-breaks applied.
        let chosen = valid_asks
            .first()
            .map(|a| (*a, PriceSource::Listing))
            .or_else(|| {
                offers
                    .iter()
                    .find(|o| o.strategy_kind != OrderStrategy::CollectionOffer)
                    .map(|o| (o, PriceSource::Offer))
            });

        let price = match chosen {
            Some((source, origin)) => PriceProjection {
                price: source.display_price,
                payment_token: lowercase_address(&source.currency),
                price_in_usd: source.price_in_usd,
                price_source: origin,
                instant_liquidity_usd,
            },
            None => PriceProjection {
                instant_liquidity_usd,
                ..PriceProjection::default()
            },
        };

        self.storage
            .update_item_listing_state(item.chain_id, &item.contract, &item.token_id, &listing, now)
            .await?;
        self.storage
            .update_item_price(item.chain_id, &item.contract, &item.token_id, &price, now)
            .await?;
        Ok(())
    }
}

fn unique_signers(items: &[&OrderItemRecord]) -> Vec<String> {
    items
        .iter()
        .map(|i| lowercase_address(&i.signer))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn to_maker_order(request: &PlaceOrderRequest) -> MakerOrder {
    MakerOrder {
        isAsk: request.is_ask,
        signer: request.signer,
        items: request
            .items
            .iter()
            .map(|i| OrderItemAbi {
                collection: i.collection,
                tokenId: i.token_id,
                amount: U256::from(i.amount),
                price: i.price,
            })
            .collect(),
        strategy: request.strategy,
        currency: request.currency,
        nonce: U256::from(request.nonce),
        startTime: U256::from(request.start_time.max(0) as u64),
        endTime: U256::from(request.end_time.max(0) as u64),
        minPercentageToAsk: U256::from(request.min_percentage_to_ask),
        params: alloy::primitives::Bytes::copy_from_slice(&request.params),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;
    use alloy::primitives::address;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;
    use nfttrack_core::ActivityKind;

    const STRATEGY_FIXED: Address = address!("0000000000000000000000000000000000000101");
    const STRATEGY_PRIVATE: Address = address!("0000000000000000000000000000000000000102");
    const STRATEGY_COLLECTION: Address = address!("0000000000000000000000000000000000000103");
    const WETH: Address = address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    const COLLECTION: Address = address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d");

    struct RejectAll;

    #[async_trait]
    impl SignatureChecker for RejectAll {
        async fn is_valid_contract_signature(
            &self,
            _signer: Address,
            _digest: B256,
            _signature: &[u8],
        ) -> Result<bool> {
            Ok(false)
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl SignatureChecker for AcceptAll {
        async fn is_valid_contract_signature(
            &self,
            _signer: Address,
            _digest: B256,
            _signature: &[u8],
        ) -> Result<bool> {
            Ok(true)
        }
    }

    fn contracts() -> ContractsConfig {
        ContractsConfig {
            exchange: address!("59728544b08ab483533076417fbbb2fd0b17ce3a"),
            royalty_registry: None,
            apecoin_staking: None,
            punk: None,
            strategy_fixed_price: STRATEGY_FIXED,
            strategy_private_sale: STRATEGY_PRIVATE,
            strategy_collection_offer: STRATEGY_COLLECTION,
        }
    }

    fn pay_tokens() -> Vec<PayTokenConfig> {
        vec![PayTokenConfig {
            address: WETH,
            symbol: "WETH".to_string(),
            decimals: 18,
            usd_rate: 2000.0,
            native_rate: 1.0,
            is_native: true,
        }]
    }

    async fn order_book(
        storage: Storage,
        checker: Arc<dyn SignatureChecker>,
    ) -> OrderBook {
        OrderBook::new(1, &contracts(), &pay_tokens(), storage, checker)
    }

    fn one_eth() -> U256 {
        U256::from(10u64).pow(U256::from(18u64))
    }

    /// An ask over token 7, signed by `signer` for chain 1.
    fn signed_ask(signer: &PrivateKeySigner, book: &OrderBook, nonce: u64) -> PlaceOrderRequest {
        let mut request = PlaceOrderRequest {
            is_ask: true,
            signer: signer.address(),
            items: vec![OrderItemInput {
                collection: COLLECTION,
                token_id: U256::from(7u64),
                amount: 1,
                price: one_eth(),
            }],
            strategy: STRATEGY_FIXED,
            currency: WETH,
            nonce,
            start_time: 0,
            end_time: 4_000_000_000,
            min_percentage_to_ask: 8_500,
            marketplace: "x".to_string(),
            params: Bytes::new(),
            sig_v: 0,
            sig_r: B256::ZERO,
            sig_s: B256::ZERO,
            fee_dist_type: "standard".to_string(),
        };
        sign(signer, book, &mut request);
        request
    }

    fn sign(signer: &PrivateKeySigner, book: &OrderBook, request: &mut PlaceOrderRequest) {
        let digest = hash_order(&to_maker_order(request), book.chain_id, book.exchange);
        let signature = signer.sign_hash_sync(&digest).unwrap();
        request.sig_v = if signature.v() { 28 } else { 27 };
        request.sig_r = B256::from(signature.r());
        request.sig_s = B256::from(signature.s());
    }

    async fn seed_owned_item(storage: &Storage, owner: Address) {
        storage
            .ensure_item(1, &COLLECTION, &U256::from(7u64), TokenType::Erc721, 100)
            .await
            .unwrap();
        storage
            .set_item_owner(1, &COLLECTION, &U256::from(7u64), &owner, 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_place_order_projects_price() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let signer = PrivateKeySigner::random();
        seed_owned_item(&storage, signer.address()).await;

        let request = signed_ask(&signer, &book, 1);
        let order_hash = book.place_order(&request, 1_000).await.unwrap();

        let order = storage.get_order(1, &order_hash).await.unwrap().unwrap();
        assert_eq!(order.signer, signer.address());

        let item = storage
            .get_item(1, &COLLECTION, &U256::from(7u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.price, 1.0);
        assert_eq!(item.price_in_usd, 2000.0);
        assert_eq!(item.price_source, PriceSource::Listing);
        assert!(item.has_active_listings);
        assert_eq!(item.listed_at, Some(1_000));
        assert_eq!(item.listing_owners, vec![lowercase_address(&signer.address())]);

        let feed = storage
            .list_activity_for_token(1, &COLLECTION, &U256::from(7u64), 10)
            .await
            .unwrap();
        assert!(feed.iter().any(|a| a.kind == ActivityKind::List));

        let nonces = storage.get_nonce_record(1, &signer.address()).await.unwrap();
        assert_eq!(nonces.available_nonce, 2);
    }

    #[tokio::test]
    async fn test_rejects_nonce_below_cutoff_and_duplicates() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let signer = PrivateKeySigner::random();
        seed_owned_item(&storage, signer.address()).await;

        storage
            .set_min_valid_order_nonce(1, &signer.address(), 5)
            .await
            .unwrap();
        let request = signed_ask(&signer, &book, 4);
        assert!(matches!(
            book.place_order(&request, 1_000).await,
            Err(OrderError::InvalidNonce { nonce: 4, min: 5 })
        ));

        let request = signed_ask(&signer, &book, 6);
        book.place_order(&request, 1_000).await.unwrap();
        // Same nonce again, different end time so the hash differs.
        let mut again = signed_ask(&signer, &book, 6);
        again.end_time += 1;
        sign(&signer, &book, &mut again);
        assert!(matches!(
            book.place_order(&again, 1_000).await,
            Err(OrderError::DuplicateNonce(6))
        ));
    }

    #[tokio::test]
    async fn test_rejects_strategy_side_mismatch() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage, Arc::new(RejectAll)).await;
        let signer = PrivateKeySigner::random();

        let mut request = signed_ask(&signer, &book, 1);
        request.strategy = STRATEGY_COLLECTION; // collection offers must be bids
        sign(&signer, &book, &mut request);
        assert!(matches!(
            book.place_order(&request, 1_000).await,
            Err(OrderError::InvalidSide { .. })
        ));

        let mut request = signed_ask(&signer, &book, 1);
        request.strategy = Address::from([0x99; 20]);
        sign(&signer, &book, &mut request);
        assert!(matches!(
            book.place_order(&request, 1_000).await,
            Err(OrderError::UnknownStrategy(_))
        ));
    }

    #[tokio::test]
    async fn test_signature_paths() {
        let (storage, _temp_db) = test_storage().await;
        let signer = PrivateKeySigner::random();
        seed_owned_item(&storage, signer.address()).await;

        // Tampered signature, no 1271 fallback: rejected.
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let mut request = signed_ask(&signer, &book, 1);
        request.sig_r = B256::repeat_byte(0x01);
        assert!(matches!(
            book.place_order(&request, 1_000).await,
            Err(OrderError::InvalidSignature)
        ));

        // Unrecoverable EOA signature but the wallet contract accepts.
        let book = order_book(storage, Arc::new(AcceptAll)).await;
        let mut request = signed_ask(&signer, &book, 1);
        request.sig_r = B256::repeat_byte(0x01);
        book.place_order(&request, 1_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_price_falls_back_to_offer_then_empty() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let seller = PrivateKeySigner::random();
        let bidder = PrivateKeySigner::random();
        seed_owned_item(&storage, seller.address()).await;

        // A listing at 1 ETH expiring at t=2000 and a bid at 0.5 ETH.
        let mut ask = signed_ask(&seller, &book, 1);
        ask.end_time = 2_000;
        sign(&seller, &book, &mut ask);
        book.place_order(&ask, 1_000).await.unwrap();

        let mut bid = signed_ask(&bidder, &book, 1);
        bid.is_ask = false;
        bid.items[0].price = one_eth() / U256::from(2u64);
        sign(&bidder, &book, &mut bid);
        book.place_order(&bid, 1_000).await.unwrap();

        let id = ItemId::new(1, COLLECTION, U256::from(7u64));
        book.refresh_listing_and_offer_state(&id, 1_500).await.unwrap();
        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert_eq!(item.price, 1.0);
        assert_eq!(item.price_source, PriceSource::Listing);

        // Listing expired: the bid takes over.
        book.refresh_listing_and_offer_state(&id, 2_500).await.unwrap();
        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert_eq!(item.price, 0.5);
        assert_eq!(item.price_source, PriceSource::Offer);
        assert!(!item.has_active_listings);
        assert_eq!(item.instant_liquidity_usd, 1000.0);

        // Everything expired: empty tuple.
        book.refresh_listing_and_offer_state(&id, 5_000_000_000).await.unwrap();
        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert_eq!(item.price, 0.0);
        assert_eq!(item.price_source, PriceSource::None);
        assert!(!item.has_order);
    }

    #[tokio::test]
    async fn test_collection_offer_feeds_liquidity_not_price() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let bidder = PrivateKeySigner::random();
        storage
            .ensure_item(1, &COLLECTION, &U256::from(7u64), TokenType::Erc721, 100)
            .await
            .unwrap();

        let mut offer = signed_ask(&bidder, &book, 1);
        offer.is_ask = false;
        offer.strategy = STRATEGY_COLLECTION;
        offer.items[0].token_id = U256::ZERO;
        offer.items[0].price = one_eth() / U256::from(20u64); // 100 USD
        sign(&bidder, &book, &mut offer);
        book.place_order(&offer, 1_000).await.unwrap();

        let id = ItemId::new(1, COLLECTION, U256::from(7u64));
        book.refresh_listing_and_offer_state(&id, 1_500).await.unwrap();

        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert_eq!(item.instant_liquidity_usd, 100.0);
        assert_eq!(item.offer_owners, vec![lowercase_address(&bidder.address())]);
        assert_eq!(item.price, 0.0);
        assert_eq!(item.price_source, PriceSource::None);
        assert!(item.has_order);
    }

    #[tokio::test]
    async fn test_transfer_invalidates_ask_via_refresh_orders() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let seller = PrivateKeySigner::random();
        seed_owned_item(&storage, seller.address()).await;

        let request = signed_ask(&seller, &book, 1);
        let order_hash = book.place_order(&request, 1_000).await.unwrap();

        // Token moves away from the seller.
        let new_owner = Address::from([0xbb; 20]);
        storage
            .set_item_owner(1, &COLLECTION, &U256::from(7u64), &new_owner, 1_100)
            .await
            .unwrap();

        let id = ItemId::new(1, COLLECTION, U256::from(7u64));
        book.refresh_orders(&id, 1_200).await.unwrap();
        book.refresh_listing_and_offer_state(&id, 1_200).await.unwrap();

        let items = storage.get_order_items(1, &order_hash).await.unwrap();
        assert!(!items[0].is_valid);
        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert!(!item.has_active_listings);
        assert_eq!(
            item.inactive_listing_owners,
            vec![lowercase_address(&seller.address())]
        );
    }

    #[tokio::test]
    async fn test_cancel_by_nonce_writes_activities() {
        let (storage, _temp_db) = test_storage().await;
        let book = order_book(storage.clone(), Arc::new(RejectAll)).await;
        let signer = PrivateKeySigner::random();
        seed_owned_item(&storage, signer.address()).await;

        for nonce in 1..=2u64 {
            let request = signed_ask(&signer, &book, nonce);
            book.place_order(&request, 1_000).await.unwrap();
        }
        let mut bid = signed_ask(&signer, &book, 3);
        bid.is_ask = false;
        sign(&signer, &book, &mut bid);
        book.place_order(&bid, 1_000).await.unwrap();

        let meta = ChainEventMeta {
            block_number: 120,
            tx_hash: B256::repeat_byte(0xaa),
            log_index: 3,
            time: 1_200,
        };
        let affected = book
            .cancel_by_nonce(&signer.address(), 4, Some(&meta), 1_200)
            .await
            .unwrap();
        assert_eq!(affected.len(), 3);

        let feed = storage
            .list_activity_for_token(1, &COLLECTION, &U256::from(7u64), 50)
            .await
            .unwrap();
        let cancels_listing = feed
            .iter()
            .filter(|a| a.kind == ActivityKind::CancelListing)
            .count();
        let cancels_offer = feed
            .iter()
            .filter(|a| a.kind == ActivityKind::CancelOffer)
            .count();
        assert_eq!(cancels_listing, 2);
        assert_eq!(cancels_offer, 1);

        let item = storage.get_item(1, &COLLECTION, &U256::from(7u64)).await.unwrap().unwrap();
        assert!(!item.has_order);
    }
}
