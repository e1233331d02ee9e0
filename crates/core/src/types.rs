//! Core domain types for the NFT event tracker.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Contract standard of a tracked collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// ERC-721, single owner per token.
    Erc721,
    /// ERC-1155, per-owner balances.
    Erc1155,
    /// CryptoPunks, pre-standard single owner per token.
    Punk,
}

impl TokenType {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Erc721 => "721",
            TokenType::Erc1155 => "1155",
            TokenType::Punk => "punk",
        }
    }

    /// True when the token carries a single `owner` field rather than
    /// per-owner holdings.
    pub fn is_single_owner(&self) -> bool {
        !matches!(self, TokenType::Erc1155)
    }
}

impl std::str::FromStr for TokenType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "721" => Ok(TokenType::Erc721),
            "1155" => Ok(TokenType::Erc1155),
            "punk" => Ok(TokenType::Punk),
            _ => Err(CoreError::InvalidTokenType(s.to_string())),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an NFT item in the metadata-hosting pipeline.
///
/// ```text
/// new → has_token_uri → has_image_url → has_hosted_image
///     → parsing_attributes → fetching_animation → done
/// new_refreshing → has_token_uri_refreshing → has_image_url → …
/// invalid (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// Freshly discovered item, nothing fetched yet.
    New,
    /// Re-index requested; retry counter has been reset.
    NewRefreshing,
    /// Raw token URI stored.
    HasTokenUri,
    /// Raw token URI stored during a refresh pass.
    HasTokenUriRefreshing,
    /// Metadata fetched, image URL extracted.
    HasImageUrl,
    /// Image bytes downloaded and re-hosted.
    HasHostedImage,
    /// Attributes parsed from metadata.
    ParsingAttributes,
    /// Animation asset fetched (when present).
    FetchingAnimation,
    /// Pipeline complete.
    Done,
    /// Retry cap exhausted; parked until an explicit refresh.
    Invalid,
}

impl IndexerState {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexerState::New => "new",
            IndexerState::NewRefreshing => "new_refreshing",
            IndexerState::HasTokenUri => "has_token_uri",
            IndexerState::HasTokenUriRefreshing => "has_token_uri_refreshing",
            IndexerState::HasImageUrl => "has_image_url",
            IndexerState::HasHostedImage => "has_hosted_image",
            IndexerState::ParsingAttributes => "parsing_attributes",
            IndexerState::FetchingAnimation => "fetching_animation",
            IndexerState::Done => "done",
            IndexerState::Invalid => "invalid",
        }
    }

    /// The state an item moves to after this stage succeeds.
    ///
    /// `Done` and `Invalid` are terminal and return themselves.
    pub fn next(&self) -> IndexerState {
        match self {
            IndexerState::New => IndexerState::HasTokenUri,
            IndexerState::NewRefreshing => IndexerState::HasTokenUriRefreshing,
            IndexerState::HasTokenUri | IndexerState::HasTokenUriRefreshing => {
                IndexerState::HasImageUrl
            }
            IndexerState::HasImageUrl => IndexerState::HasHostedImage,
            IndexerState::HasHostedImage => IndexerState::ParsingAttributes,
            IndexerState::ParsingAttributes => IndexerState::FetchingAnimation,
            IndexerState::FetchingAnimation => IndexerState::Done,
            IndexerState::Done => IndexerState::Done,
            IndexerState::Invalid => IndexerState::Invalid,
        }
    }

    /// "Ready to serve": the raw URI has been obtained and the item is
    /// safe to surface to readers.
    pub fn is_ready_to_serve(&self) -> bool {
        !matches!(
            self,
            IndexerState::New | IndexerState::NewRefreshing | IndexerState::Invalid
        )
    }

    /// True for the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IndexerState::Done | IndexerState::Invalid)
    }
}

impl std::str::FromStr for IndexerState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IndexerState::New),
            "new_refreshing" => Ok(IndexerState::NewRefreshing),
            "has_token_uri" => Ok(IndexerState::HasTokenUri),
            "has_token_uri_refreshing" => Ok(IndexerState::HasTokenUriRefreshing),
            "has_image_url" => Ok(IndexerState::HasImageUrl),
            "has_hosted_image" => Ok(IndexerState::HasHostedImage),
            "parsing_attributes" => Ok(IndexerState::ParsingAttributes),
            "fetching_animation" => Ok(IndexerState::FetchingAnimation),
            "done" => Ok(IndexerState::Done),
            "invalid" => Ok(IndexerState::Invalid),
            _ => Err(CoreError::InvalidIndexerState(s.to_string())),
        }
    }
}

impl fmt::Display for IndexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of an activity-journal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    /// Token minted (transfer from the zero address).
    Mint,
    /// Token transferred between accounts.
    Transfer,
    /// Ask order placed.
    List,
    /// Bid order placed.
    Offer,
    /// Ask order cancelled.
    CancelListing,
    /// Bid order cancelled.
    CancelOffer,
    /// Order filled on-chain.
    Sale,
}

impl ActivityKind {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Mint => "mint",
            ActivityKind::Transfer => "transfer",
            ActivityKind::List => "list",
            ActivityKind::Offer => "offer",
            ActivityKind::CancelListing => "cancelListing",
            ActivityKind::CancelOffer => "cancelOffer",
            ActivityKind::Sale => "sale",
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mint" => Ok(ActivityKind::Mint),
            "transfer" => Ok(ActivityKind::Transfer),
            "list" => Ok(ActivityKind::List),
            "offer" => Ok(ActivityKind::Offer),
            "cancelListing" => Ok(ActivityKind::CancelListing),
            "cancelOffer" => Ok(ActivityKind::CancelOffer),
            "sale" => Ok(ActivityKind::Sale),
            _ => Err(CoreError::InvalidActivityKind(s.to_string())),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution semantic of a maker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStrategy {
    /// Standard fixed-price order, either side.
    FixedPrice,
    /// Ask restricted to a counterparty encoded in `params`.
    PrivateSale,
    /// Bid on any token of a collection.
    CollectionOffer,
}

impl OrderStrategy {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStrategy::FixedPrice => "fixedPrice",
            OrderStrategy::PrivateSale => "privateSale",
            OrderStrategy::CollectionOffer => "collectionOffer",
        }
    }

    /// Validate the strategy/side combination.
    ///
    /// `privateSale` requires an ask, `collectionOffer` requires a bid,
    /// `fixedPrice` allows either.
    pub fn allows_side(&self, is_ask: bool) -> bool {
        match self {
            OrderStrategy::FixedPrice => true,
            OrderStrategy::PrivateSale => is_ask,
            OrderStrategy::CollectionOffer => !is_ask,
        }
    }
}

impl std::str::FromStr for OrderStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixedPrice" => Ok(OrderStrategy::FixedPrice),
            "privateSale" => Ok(OrderStrategy::PrivateSale),
            "collectionOffer" => Ok(OrderStrategy::CollectionOffer),
            _ => Err(CoreError::InvalidOrderStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for OrderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which order the item's price projection was resolved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// No eligible order; price fields are zero/empty.
    #[default]
    None,
    /// Cheapest valid listing.
    Listing,
    /// Most expensive active offer.
    Offer,
}

impl PriceSource {
    /// Convert to database string representation (empty for none).
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::None => "",
            PriceSource::Listing => "listing",
            PriceSource::Offer => "offer",
        }
    }
}

impl std::str::FromStr for PriceSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(PriceSource::None),
            "listing" => Ok(PriceSource::Listing),
            "offer" => Ok(PriceSource::Offer),
            _ => Err(CoreError::Other(format!("invalid price source: {s}"))),
        }
    }
}

/// Aggregation window for trading volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingPeriod {
    /// One hour.
    Hour,
    /// Six hours.
    SixHours,
    /// One day.
    Day,
    /// One week.
    Week,
    /// One month.
    Month,
    /// All time (single running bucket).
    All,
}

impl TradingPeriod {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingPeriod::Hour => "1h",
            TradingPeriod::SixHours => "6h",
            TradingPeriod::Day => "day",
            TradingPeriod::Week => "week",
            TradingPeriod::Month => "month",
            TradingPeriod::All => "all",
        }
    }

    /// Truncate a unix timestamp to the start of this period's bucket.
    ///
    /// Weeks start on Thursday 00:00 UTC (epoch day zero); months are
    /// approximated by the 30-day bucket the original engine used. The
    /// `all` period maps everything to bucket zero.
    pub fn truncate(&self, unix_secs: i64) -> i64 {
        const HOUR: i64 = 3_600;
        const DAY: i64 = 86_400;
        match self {
            TradingPeriod::Hour => unix_secs - unix_secs.rem_euclid(HOUR),
            TradingPeriod::SixHours => unix_secs - unix_secs.rem_euclid(6 * HOUR),
            TradingPeriod::Day => unix_secs - unix_secs.rem_euclid(DAY),
            TradingPeriod::Week => unix_secs - unix_secs.rem_euclid(7 * DAY),
            TradingPeriod::Month => unix_secs - unix_secs.rem_euclid(30 * DAY),
            TradingPeriod::All => 0,
        }
    }
}

impl std::str::FromStr for TradingPeriod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TradingPeriod::Hour),
            "6h" => Ok(TradingPeriod::SixHours),
            "day" => Ok(TradingPeriod::Day),
            "week" => Ok(TradingPeriod::Week),
            "month" => Ok(TradingPeriod::Month),
            "all" => Ok(TradingPeriod::All),
            _ => Err(CoreError::InvalidTradingPeriod(s.to_string())),
        }
    }
}

/// Canonical key of an NFT item: `(chainId, contract, tokenId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
    /// Chain id.
    pub chain_id: u64,
    /// Collection contract address.
    pub contract: Address,
    /// Token id (arbitrary precision).
    pub token_id: U256,
}

impl ItemId {
    /// Create a new item key.
    pub fn new(chain_id: u64, contract: Address, token_id: U256) -> Self {
        Self {
            chain_id,
            contract,
            token_id,
        }
    }

    /// Lower-cased hex contract address, as persisted.
    pub fn contract_str(&self) -> String {
        lowercase_address(&self.contract)
    }

    /// Decimal token id string, as persisted.
    pub fn token_id_str(&self) -> String {
        self.token_id.to_string()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.chain_id,
            self.contract_str(),
            self.token_id
        )
    }
}

/// One trait of an NFT item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    /// Trait type, e.g. "Background".
    #[serde(rename = "trait_type")]
    pub trait_type: String,
    /// Trait value, e.g. "Aquamarine".
    pub value: String,
}

impl Attribute {
    /// Convenience constructor.
    pub fn new(trait_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            trait_type: trait_type.into(),
            value: value.into(),
        }
    }
}

/// Lower-cased `0x`-prefixed hex rendering of an address.
///
/// All addresses are persisted in this form.
pub fn lowercase_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Parse a lower- or mixed-case hex address string.
pub fn parse_address(s: &str) -> Result<Address, CoreError> {
    s.parse::<Address>().map_err(|_| CoreError::InvalidHex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn token_type_round_trip() {
        for t in [TokenType::Erc721, TokenType::Erc1155, TokenType::Punk] {
            assert_eq!(TokenType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(TokenType::from_str("erc20").is_err());
        assert!(TokenType::Erc721.is_single_owner());
        assert!(!TokenType::Erc1155.is_single_owner());
    }

    #[test]
    fn indexer_state_lifecycle() {
        let mut state = IndexerState::New;
        let mut seen = vec![state];
        while !state.is_terminal() {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                IndexerState::New,
                IndexerState::HasTokenUri,
                IndexerState::HasImageUrl,
                IndexerState::HasHostedImage,
                IndexerState::ParsingAttributes,
                IndexerState::FetchingAnimation,
                IndexerState::Done,
            ]
        );
        assert_eq!(
            IndexerState::NewRefreshing.next(),
            IndexerState::HasTokenUriRefreshing
        );
        assert_eq!(
            IndexerState::HasTokenUriRefreshing.next(),
            IndexerState::HasImageUrl
        );
        assert_eq!(IndexerState::Invalid.next(), IndexerState::Invalid);
    }

    #[test]
    fn ready_to_serve_excludes_new_and_invalid() {
        assert!(!IndexerState::New.is_ready_to_serve());
        assert!(!IndexerState::NewRefreshing.is_ready_to_serve());
        assert!(!IndexerState::Invalid.is_ready_to_serve());
        assert!(IndexerState::HasTokenUri.is_ready_to_serve());
        assert!(IndexerState::Done.is_ready_to_serve());
    }

    #[test]
    fn price_source_round_trip_and_default() {
        for s in [PriceSource::None, PriceSource::Listing, PriceSource::Offer] {
            assert_eq!(PriceSource::from_str(s.as_str()).unwrap(), s);
        }
        // A freshly materialized item row carries no price projection.
        assert_eq!(PriceSource::default(), PriceSource::None);
    }

    #[test]
    fn strategy_side_rules() {
        assert!(OrderStrategy::FixedPrice.allows_side(true));
        assert!(OrderStrategy::FixedPrice.allows_side(false));
        assert!(OrderStrategy::PrivateSale.allows_side(true));
        assert!(!OrderStrategy::PrivateSale.allows_side(false));
        assert!(!OrderStrategy::CollectionOffer.allows_side(true));
        assert!(OrderStrategy::CollectionOffer.allows_side(false));
    }

    #[test]
    fn period_truncation() {
        // 2022-06-15T13:37:21Z
        let t = 1_655_300_241;
        assert_eq!(TradingPeriod::Hour.truncate(t), 1_655_298_000);
        assert_eq!(TradingPeriod::Day.truncate(t), 1_655_251_200);
        assert_eq!(TradingPeriod::All.truncate(t), 0);
        assert_eq!(TradingPeriod::Day.truncate(t) % 86_400, 0);
    }

    #[test]
    fn lowercase_address_formatting() {
        let addr = Address::from([0xAB; 20]);
        let s = lowercase_address(&addr);
        assert_eq!(s, format!("0x{}", "ab".repeat(20)));
        assert_eq!(parse_address(&s).unwrap(), addr);
    }

    #[test]
    fn item_id_display() {
        let id = ItemId::new(1, Address::from([0x01; 20]), U256::from(42u64));
        assert_eq!(id.to_string(), format!("1:0x{}:42", "01".repeat(20)));
    }
}
