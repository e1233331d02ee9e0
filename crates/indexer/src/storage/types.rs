//! Record types stored by the indexer.
//!
//! Addresses are persisted as lower-cased 0x-hex strings, token ids and
//! raw wei amounts as decimal strings, timestamps as unix seconds.

use alloy::primitives::{Address, B256, U256};
use nfttrack_core::{ActivityKind, Attribute, IndexerState, OrderStrategy, PriceSource, TokenType};
use std::collections::BTreeMap;

/// A tracked collection (one row per contract).
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRecord {
    pub chain_id: u64,
    pub address: Address,
    pub name: String,
    pub token_type: TokenType,
    pub supply: u64,
    pub num_owners: u64,
    pub floor_price_native: f64,
    pub floor_price_usd: f64,
    pub opensea_floor_native: f64,
    pub opensea_floor_usd: f64,
    pub highest_sale: f64,
    pub has_been_sold: bool,
    pub last_sold_at: Option<i64>,
    pub last_listed_at: Option<i64>,
    /// Trait histogram: trait type -> value -> count.
    pub attributes: BTreeMap<String, BTreeMap<String, u64>>,
    /// Cheapest valid listing per trait value, in native units.
    pub trait_floor_price: BTreeMap<String, BTreeMap<String, f64>>,
    /// Hash of the serialized histogram; rarity recomputes only on change.
    pub attributes_hash: String,
    pub should_calculate_openrarity: bool,
    pub is_appropriate: bool,
    /// On-chain royalty override as a JSON array of `{receiver, fee_bps}`.
    pub royalty_override: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A row in the contract catalog scanned for new trackers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEntry {
    pub chain_id: u64,
    pub address: Address,
    pub token_type: TokenType,
    pub is_appropriate: bool,
}

/// A single NFT item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub chain_id: u64,
    pub contract: Address,
    pub token_id: U256,
    pub token_type: TokenType,
    /// Current owner; meaningful for single-owner tokens only.
    pub owner: String,
    pub token_uri: String,
    pub image_url: String,
    pub hosted_token_uri: String,
    pub hosted_image_url: String,
    pub thumbnail_path: String,
    pub animation_url: String,
    pub hosted_animation_url: String,
    pub mime_type: String,
    pub content_type: String,
    pub attributes: Vec<Attribute>,
    pub price: f64,
    pub payment_token: String,
    pub price_in_usd: f64,
    pub price_source: PriceSource,
    pub instant_liquidity_usd: f64,
    pub has_order: bool,
    pub has_active_listings: bool,
    pub listing_ends_at: i64,
    pub listing_owners: Vec<String>,
    pub inactive_listing_owners: Vec<String>,
    pub offer_starts_at: i64,
    pub offer_ends_at: i64,
    pub offer_owners: Vec<String>,
    pub indexer_state: IndexerState,
    pub indexer_retry_count: u32,
    pub is_appropriate: bool,
    pub is_filtered: bool,
    pub supply: u64,
    pub num_owners: u64,
    pub openrarity_rank: Option<u64>,
    pub openrarity_score: Option<f64>,
    pub last_sale_price: f64,
    pub last_sale_price_usd: f64,
    pub last_sale_payment_token: String,
    pub sold_at: Option<i64>,
    pub listed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ItemRecord {
    /// A fresh item as first seen by a transfer handler.
    pub fn new(chain_id: u64, contract: Address, token_id: U256, token_type: TokenType) -> Self {
        Self {
            chain_id,
            contract,
            token_id,
            token_type,
            owner: String::new(),
            token_uri: String::new(),
            image_url: String::new(),
            hosted_token_uri: String::new(),
            hosted_image_url: String::new(),
            thumbnail_path: String::new(),
            animation_url: String::new(),
            hosted_animation_url: String::new(),
            mime_type: String::new(),
            content_type: String::new(),
            attributes: Vec::new(),
            price: 0.0,
            payment_token: String::new(),
            price_in_usd: 0.0,
            price_source: PriceSource::None,
            instant_liquidity_usd: 0.0,
            has_order: false,
            has_active_listings: false,
            listing_ends_at: 0,
            listing_owners: Vec::new(),
            inactive_listing_owners: Vec::new(),
            offer_starts_at: 0,
            offer_ends_at: 0,
            offer_owners: Vec::new(),
            indexer_state: IndexerState::New,
            indexer_retry_count: 0,
            is_appropriate: true,
            is_filtered: false,
            supply: 0,
            num_owners: 0,
            openrarity_rank: None,
            openrarity_score: None,
            last_sale_price: 0.0,
            last_sale_price_usd: 0.0,
            last_sale_payment_token: String::new(),
            sold_at: None,
            listed_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// An ERC-1155 per-owner balance. Rows exist only while `balance > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingRecord {
    pub chain_id: u64,
    pub contract: Address,
    pub token_id: U256,
    pub owner: Address,
    pub balance: u64,
}

/// A validated maker order (EIP-712 envelope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub chain_id: u64,
    pub order_hash: B256,
    pub is_ask: bool,
    pub signer: Address,
    pub strategy: Address,
    pub strategy_kind: OrderStrategy,
    pub currency: Address,
    pub nonce: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub min_percentage_to_ask: u64,
    pub marketplace: String,
    /// ABI-encoded strategy params, 0x-hex.
    pub params: String,
    pub sig_v: u8,
    pub sig_r: B256,
    pub sig_s: B256,
    pub fee_dist_type: String,
    pub created_at: i64,
}

/// One item of a maker order, denormalized for per-token queries.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItemRecord {
    pub chain_id: u64,
    pub order_hash: B256,
    pub item_idx: u32,
    pub order_item_hash: B256,
    pub hex_nonce: String,
    pub is_ask: bool,
    pub signer: Address,
    pub collection: Address,
    pub token_id: U256,
    pub amount: u64,
    /// Raw wei price.
    pub price: U256,
    pub strategy: Address,
    pub strategy_kind: OrderStrategy,
    pub currency: Address,
    pub nonce: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub display_price: f64,
    pub price_in_usd: f64,
    pub price_in_native: f64,
    pub reserved_buyer: Option<Address>,
    pub is_valid: bool,
    pub is_used: bool,
    pub marketplace: String,
    pub created_at: i64,
}

impl OrderItemRecord {
    /// An order item is live when valid, unused and inside its time window.
    pub fn is_live(&self, now: i64) -> bool {
        self.is_valid && !self.is_used && self.start_time <= now && now < self.end_time
    }
}

/// Per-signer nonce bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonceRecord {
    pub min_valid_order_nonce: u64,
    pub available_nonce: u64,
}

/// One activity feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub chain_id: u64,
    pub collection: Address,
    pub token_id: U256,
    pub kind: ActivityKind,
    pub account: String,
    pub to_account: String,
    pub quantity: u64,
    /// Raw wei price, zero for transfers.
    pub price: U256,
    pub price_in_usd: f64,
    pub price_in_native: f64,
    pub block_number: Option<u64>,
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub time: i64,
    pub source: String,
}

/// A tracker checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerState {
    /// Unique owner tag, e.g. `1:0xabc..def:transfers`.
    pub tag: String,
    pub last_block_processed: u64,
}

/// A cached block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub chain_id: u64,
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

/// Per-period trading volume bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    pub chain_id: u64,
    pub address: Address,
    pub period: String,
    pub date: i64,
    pub volume: f64,
    pub volume_in_usd: f64,
}

/// Daily floor price sample.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorPriceRecord {
    pub chain_id: u64,
    pub address: Address,
    /// UTC midnight of the sampled day.
    pub date: i64,
    pub price_in_native: f64,
    pub price_in_usd: f64,
    pub num_owners: u64,
    pub opensea_price_in_native: f64,
    pub opensea_price_in_usd: f64,
}

/// ApeCoin staking position flag for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingRecord {
    pub chain_id: u64,
    pub contract: Address,
    pub token_id: U256,
    pub staked: bool,
}
