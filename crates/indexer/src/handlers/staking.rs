//! ApeCoin staking handler.
//!
//! Flags tokens that back a staking position so the listing surface can
//! warn buyers. Deposits and withdrawals arrive per pool; the pool id
//! maps to a collection contract at construction time.

use std::collections::HashMap;

use alloy::primitives::{Address, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EventHandler, LogEnvelope};
use crate::storage::Storage;

sol! {
    event DepositNft(address indexed user, uint256 indexed poolId, uint256 amount, uint256 tokenId);
    event WithdrawNft(address indexed user, uint256 indexed poolId, uint256 amount, uint256 tokenId);
}

/// Reducer for the ApeCoin staking contract.
pub struct StakingHandler {
    chain_id: u64,
    /// Pool id to collection contract, e.g. 1 -> BAYC.
    pools: HashMap<u64, Address>,
    storage: Storage,
}

impl StakingHandler {
    /// Handler for the staking contract on `chain_id` with the given
    /// pool-to-collection map.
    pub fn new(chain_id: u64, pools: HashMap<u64, Address>, storage: Storage) -> Self {
        Self {
            chain_id,
            pools,
            storage,
        }
    }

    async fn set_staked(
        &self,
        pool_id: u64,
        token_id: alloy::primitives::U256,
        staked: bool,
    ) -> Result<()> {
        let Some(contract) = self.pools.get(&pool_id) else {
            debug!(pool_id, "ignoring staking event for unmapped pool");
            return Ok(());
        };
        self.storage
            .set_token_staked(self.chain_id, contract, &token_id, staked)
            .await
    }
}

#[async_trait]
impl EventHandler for StakingHandler {
    fn name(&self) -> &str {
        "staking"
    }

    fn topics(&self) -> Vec<B256> {
        vec![DepositNft::SIGNATURE_HASH, WithdrawNft::SIGNATURE_HASH]
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let topic0 = match envelope.log.inner.topics().first() {
            Some(topic) => *topic,
            None => return Ok(()),
        };

        if topic0 == DepositNft::SIGNATURE_HASH {
            match DepositNft::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    self.set_staked(event.poolId.saturating_to(), event.tokenId, true)
                        .await
                }
                Err(err) => {
                    warn!("skipping undecodable DepositNft log: {err}");
                    Ok(())
                }
            }
        } else if topic0 == WithdrawNft::SIGNATURE_HASH {
            match WithdrawNft::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    self.set_staked(event.poolId.saturating_to(), event.tokenId, false)
                        .await
                }
                Err(err) => {
                    warn!("skipping undecodable WithdrawNft log: {err}");
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }
}
