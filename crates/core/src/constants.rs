//! Canonical constants for the NFT event tracker.
//!
//! The EIP-712 values MUST match the deployed exchange contract
//! exactly; everything else is an engine default that config may
//! override.

use alloy_primitives::{address, Address};

/// EIP-712 domain name of the exchange contract.
pub const EXCHANGE_DOMAIN_NAME: &str = "XExchange";

/// EIP-712 domain version of the exchange contract.
pub const EXCHANGE_DOMAIN_VERSION: &str = "1";

/// The zero address. Transfers from it are mints, transfers to it are burns.
pub const ZERO_ADDRESS: Address = address!("0000000000000000000000000000000000000000");

/// Default number of blocks a tracker stays behind the chain head.
pub const DEFAULT_FOLLOW_DISTANCE: u64 = 12;

/// Default block range for a single `eth_getLogs` query during catch-up.
///
/// Halved per-range on "result set too large" provider errors.
pub const DEFAULT_RANGE_LIMIT: u64 = 2_000;

/// Default cap on concurrent in-flight RPC calls against one provider.
pub const DEFAULT_RPC_PERMITS: usize = 100;

/// Default number of consumers per websocket connection before the
/// pool rotates to a fresh one.
pub const DEFAULT_WS_ROTATE_LIMIT: u32 = 15;

/// Consecutive same-class transient failures before a tracker escalates
/// to fatal.
pub const MAX_CONSECUTIVE_BACKOFFS: u32 = 3;

/// Default retry cap for the token-indexer pipeline before an item is
/// parked as `invalid`.
pub const DEFAULT_INDEXER_RETRY_LIMIT: u32 = 5;

/// Default batch size for one token-indexer scan.
pub const DEFAULT_INDEXER_BATCH: u32 = 20;

/// Default in-flight item count for the token-indexer worker pool.
pub const DEFAULT_INDEXER_WORKERS: u32 = 4;

/// Ceiling for transient-error retry backoff, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Page size for openrarity rank persistence.
pub const OPENRARITY_PAGE_SIZE: u64 = 500;
