//! End-to-end: a tracker follows a scripted chain through a reorg and
//! the ERC-721 handler ends up with the alternate chain's state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{address, Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nfttrack_core::{lowercase_address, ActivityKind, TokenType};
use nfttrack_indexer::config::{ContractsConfig, PayTokenConfig};
use nfttrack_indexer::handlers::Erc721Handler;
use nfttrack_indexer::orderbook::{OrderBook, SignatureChecker};
use nfttrack_indexer::storage::{BlockRecord, Storage};
use nfttrack_indexer::tracker::{LogSource, LogTracker, TrackerParams};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
}

const COLLECTION: Address = address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d");

fn transfer_log(from: Address, to: Address, block: u64, log_index: u64, tx_byte: u8) -> Log {
    let event = Transfer {
        from,
        to,
        tokenId: U256::from(7u64),
    };
    Log {
        inner: alloy::primitives::Log {
            address: COLLECTION,
            data: event.encode_log_data(),
        },
        block_number: Some(block),
        log_index: Some(log_index),
        transaction_hash: Some(B256::repeat_byte(tx_byte)),
        removed: false,
        ..Default::default()
    }
}

/// Scripted chain that pins block hashes into storage the way the
/// production block cache does.
struct ScriptedChain {
    storage: Storage,
    latest: Mutex<u64>,
    hashes: Mutex<HashMap<u64, B256>>,
    logs: Mutex<Vec<Log>>,
}

impl ScriptedChain {
    fn new(storage: Storage, latest: u64) -> Self {
        let hashes = (0..=latest)
            .map(|n| (n, B256::repeat_byte((n % 251) as u8 + 1)))
            .collect();
        Self {
            storage,
            latest: Mutex::new(latest),
            hashes: Mutex::new(hashes),
            logs: Mutex::new(Vec::new()),
        }
    }

    fn add_log(&self, log: Log) {
        self.logs.lock().unwrap().push(log);
    }

    /// Replace everything from `fork` up, extend the chain to
    /// `new_latest`, and put `replacement` on the new branch.
    fn reorg(&self, fork: u64, new_latest: u64, replacement: Log) {
        self.logs.lock().unwrap().retain(|log| {
            log.block_number.map(|n| n < fork).unwrap_or(false)
        });
        self.logs.lock().unwrap().push(replacement);
        let mut hashes = self.hashes.lock().unwrap();
        for n in fork..=new_latest {
            hashes.insert(n, B256::repeat_byte(0xee));
        }
        *self.latest.lock().unwrap() = new_latest;
    }
}

#[async_trait]
impl LogSource for ScriptedChain {
    async fn latest_block(&self) -> u64 {
        *self.latest.lock().unwrap()
    }

    async fn fetch_logs(
        &self,
        address: Address,
        _topics: &[B256],
        from: u64,
        to: u64,
        _archive: bool,
    ) -> Result<Vec<Log>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let n = log.block_number.unwrap_or(0);
                log.inner.address == address && n >= from && n <= to
            })
            .cloned()
            .collect())
    }

    async fn block_meta(&self, number: u64) -> Result<(B256, u64)> {
        let hash = self
            .hashes
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .context("unknown block")?;
        self.storage
            .upsert_block(&BlockRecord {
                chain_id: 1,
                number,
                hash,
                timestamp: number * 12,
            })
            .await?;
        Ok((hash, number * 12))
    }

    async fn chain_block_meta(&self, number: u64) -> Result<Option<(B256, u64)>> {
        Ok(self
            .hashes
            .lock()
            .unwrap()
            .get(&number)
            .map(|hash| (*hash, number * 12)))
    }

    async fn tx_sender(&self, _tx_hash: B256) -> Result<Option<Address>> {
        Ok(None)
    }

    async fn invalidate_blocks_from(&self, number: u64) -> Result<()> {
        self.storage.delete_blocks_from(1, number).await?;
        Ok(())
    }
}

struct NoWallets;

#[async_trait]
impl SignatureChecker for NoWallets {
    async fn is_valid_contract_signature(
        &self,
        _signer: Address,
        _digest: B256,
        _signature: &[u8],
    ) -> Result<bool> {
        Ok(false)
    }
}

fn order_book(storage: Storage) -> OrderBook {
    let contracts = ContractsConfig {
        exchange: address!("59728544b08ab483533076417fbbb2fd0b17ce3a"),
        royalty_registry: None,
        apecoin_staking: None,
        punk: None,
        strategy_fixed_price: address!("0000000000000000000000000000000000000101"),
        strategy_private_sale: address!("0000000000000000000000000000000000000102"),
        strategy_collection_offer: address!("0000000000000000000000000000000000000103"),
    };
    let pay_tokens = vec![PayTokenConfig {
        address: address!("c02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
        symbol: "WETH".to_string(),
        decimals: 18,
        usd_rate: 2000.0,
        native_rate: 1.0,
        is_native: true,
    }];
    OrderBook::new(1, &contracts, &pay_tokens, storage, Arc::new(NoWallets))
}

/// Poll until the token's owner matches, or give up.
async fn wait_for_owner(storage: &Storage, expected: &str) {
    for _ in 0..5000 {
        if let Some(item) = storage
            .get_item(1, &COLLECTION, &U256::from(7u64))
            .await
            .unwrap()
        {
            if item.owner == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("owner never became {expected}");
}

#[tokio::test]
async fn test_transfer_then_reorg_reassigns_owner() {
    let temp_db = tempfile::NamedTempFile::new().unwrap();
    let storage = Storage::new_with_path(temp_db.path()).await.unwrap();
    storage.run_migrations().await.unwrap();

    let alice = Address::from([0xaa; 20]);
    let bob = Address::from([0xbb; 20]);
    let carol = Address::from([0xcc; 20]);

    let chain = Arc::new(ScriptedChain::new(storage.clone(), 112));
    chain.add_log(transfer_log(alice, bob, 100, 0, 0x01));

    let handler = Arc::new(Erc721Handler::new(
        1,
        COLLECTION,
        storage.clone(),
        order_book(storage.clone()),
    ));
    let tracker = Arc::new(LogTracker::new(
        TrackerParams {
            chain_id: 1,
            address: COLLECTION,
            start_block: 40,
            follow_distance: 12,
            range_limit: 1000,
            block_time_secs: 12,
        },
        storage.clone(),
        chain.clone(),
        handler,
    ));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let tracker = tracker.clone();
        let shutdown = shutdown.clone();
        async move { tracker.run(shutdown).await }
    });

    wait_for_owner(&storage, &lowercase_address(&bob)).await;

    // Block 100 gets replaced: the same token moved to a different
    // recipient, and the chain grows so the new branch is under the
    // follow distance.
    chain.reorg(95, 120, transfer_log(alice, carol, 100, 0, 0x02));

    wait_for_owner(&storage, &lowercase_address(&carol)).await;

    shutdown.cancel();
    task.await.unwrap().unwrap();

    // Exactly one activity row survives, from the winning branch.
    let feed = storage
        .list_activity_for_token(1, &COLLECTION, &U256::from(7u64), 10)
        .await
        .unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].kind, ActivityKind::Transfer);
    assert_eq!(feed[0].to_account, lowercase_address(&carol));

    let item = storage
        .get_item(1, &COLLECTION, &U256::from(7u64))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.token_type, TokenType::Erc721);
}
