//! Block hash/timestamp cache.

use alloy::primitives::B256;
use anyhow::{bail, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::ThrottledClient;
use crate::storage::{BlockRecord, Storage};

/// Two-level cache in front of `eth_getBlockByNumber`.
///
/// Lookups hit an in-memory map first, then the `blocks` table, then the
/// node. Every tracker attaches a timestamp to each event and checks block
/// hashes for reorgs, so the same heights are queried over and over.
pub struct BlockMetaCache {
    chain_id: u64,
    storage: Storage,
    client: ThrottledClient,
    map: RwLock<HashMap<u64, (B256, u64)>>,
}

impl BlockMetaCache {
    pub fn new(chain_id: u64, storage: Storage, client: ThrottledClient) -> Self {
        Self {
            chain_id,
            storage,
            client,
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Hash and timestamp of a block, fetching and persisting on miss.
    pub async fn get(&self, number: u64) -> Result<(B256, u64)> {
        if let Some(meta) = self.map.read().await.get(&number).copied() {
            return Ok(meta);
        }

        if let Some(record) = self.storage.get_block(self.chain_id, number).await? {
            let meta = (record.hash, record.timestamp);
            self.map.write().await.insert(number, meta);
            return Ok(meta);
        }

        let Some((hash, timestamp)) = self.client.get_block_meta(number).await? else {
            bail!("Block {number} not known to the node");
        };

        self.seed(number, hash, timestamp).await?;
        Ok((hash, timestamp))
    }

    /// Record a header observed elsewhere (live subscription path).
    pub async fn seed(&self, number: u64, hash: B256, timestamp: u64) -> Result<()> {
        self.storage
            .upsert_block(&BlockRecord {
                chain_id: self.chain_id,
                number,
                hash,
                timestamp,
            })
            .await?;
        self.map.write().await.insert(number, (hash, timestamp));
        Ok(())
    }

    /// Forget everything at or above a height (rewind path).
    pub async fn invalidate_from(&self, number: u64) -> Result<()> {
        self.storage
            .delete_blocks_from(self.chain_id, number)
            .await?;
        self.map.write().await.retain(|n, _| *n < number);
        Ok(())
    }

    /// Drop cached heights below a cutoff (steady-state pruning).
    pub async fn prune_before(&self, number: u64) -> Result<()> {
        self.storage
            .prune_blocks_before(self.chain_id, number)
            .await?;
        self.map.write().await.retain(|n, _| *n >= number);
        Ok(())
    }
}
