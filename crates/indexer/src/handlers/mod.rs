//! Event handlers.
//!
//! A handler owns the semantics of one tracked contract: which topics it
//! wants, and what each decoded log means for storage. Trackers stay
//! generic over [`EventHandler`] and only deal in block ranges, ordering
//! and reorgs.

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use anyhow::Result;
use async_trait::async_trait;

pub mod erc1155;
pub mod erc721;
pub mod exchange;
pub mod punk;
pub mod royalty;
pub mod staking;

pub use erc1155::Erc1155Handler;
pub use erc721::{Erc721Handler, OwnershipObserver};
pub use exchange::ExchangeHandler;
pub use punk::PunkHandler;
pub use royalty::RoyaltyHandler;
pub use staking::StakingHandler;

/// One log plus the chain context handlers need.
#[derive(Debug, Clone)]
pub struct LogEnvelope {
    pub log: Log,
    /// Timestamp of the containing block.
    pub block_time: u64,
    /// Transaction sender, populated only when the handler asks for it.
    pub sender: Option<Address>,
}

impl LogEnvelope {
    pub fn block_number(&self) -> u64 {
        self.log.block_number.unwrap_or(0)
    }

    pub fn log_index(&self) -> u64 {
        self.log.log_index.unwrap_or(0)
    }

    pub fn tx_hash(&self) -> Option<B256> {
        self.log.transaction_hash
    }
}

/// Per-contract event processing.
///
/// `handle` is called once per log in `(block_number, log_index)` order.
/// Implementations must tolerate re-delivery of the same log after a crash
/// or rewind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name for log lines and the checkpoint tag.
    fn name(&self) -> &str;

    /// Event signature hashes this handler decodes.
    fn topics(&self) -> Vec<B256>;

    /// Whether the tracker should resolve the transaction sender before
    /// delivery. Costs one RPC call per log.
    fn wants_tx_sender(&self) -> bool {
        false
    }

    /// Process one decoded log.
    async fn handle(&self, envelope: &LogEnvelope) -> Result<()>;

    /// Undo chain-derived state from `from_block` onward after a reorg.
    async fn on_rewind(&self, _from_block: u64) -> Result<()> {
        Ok(())
    }
}
