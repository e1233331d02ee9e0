//! ERC-1155 transfer handler.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use nfttrack_core::{lowercase_address, parse_address, ActivityKind, ItemId, TokenType};
use std::collections::BTreeSet;
use tracing::warn;

use super::{EventHandler, LogEnvelope};
use crate::orderbook::OrderBook;
use crate::storage::{ActivityRecord, Storage};

sol! {
    /// Single-id ERC-1155 transfer.
    event TransferSingle(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256 id,
        uint256 value
    );

    /// Batched ERC-1155 transfer; one log covers many ids.
    event TransferBatch(
        address indexed operator,
        address indexed from,
        address indexed to,
        uint256[] ids,
        uint256[] values
    );
}

/// Reducer for one tracked ERC-1155 contract.
///
/// Holdings are the source of truth: every transfer debits and credits
/// per-owner balances, and the item's `supply`/`num_owners` aggregates
/// are re-derived from them afterwards.
pub struct Erc1155Handler {
    chain_id: u64,
    contract: Address,
    storage: Storage,
    orderbook: OrderBook,
}

impl Erc1155Handler {
    /// Handler for `contract` on `chain_id`.
    pub fn new(chain_id: u64, contract: Address, storage: Storage, orderbook: OrderBook) -> Self {
        Self {
            chain_id,
            contract,
            storage,
            orderbook,
        }
    }

    async fn apply_transfer(
        &self,
        from: Address,
        to: Address,
        token_id: U256,
        value: u64,
        envelope: &LogEnvelope,
    ) -> Result<()> {
        let now = envelope.block_time as i64;

        self.storage
            .ensure_collection(self.chain_id, &self.contract, TokenType::Erc1155, now)
            .await?;
        self.storage
            .ensure_item(
                self.chain_id,
                &self.contract,
                &token_id,
                TokenType::Erc1155,
                now,
            )
            .await?;

        let kind = if from == Address::ZERO {
            ActivityKind::Mint
        } else {
            ActivityKind::Transfer
        };
        // The activity row doubles as the re-delivery ledger: its unique
        // (tx, log index, token) key rejects a log we already applied, and
        // holdings deltas must only run for first-seen logs.
        let first_seen = self
            .storage
            .insert_activity(&ActivityRecord {
                chain_id: self.chain_id,
                collection: self.contract,
                token_id,
                kind,
                account: lowercase_address(&from),
                to_account: lowercase_address(&to),
                quantity: value,
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
        if !first_seen {
            return Ok(());
        }

        if from != Address::ZERO {
            self.storage
                .apply_holding_delta(self.chain_id, &self.contract, &token_id, &from, -(value as i64))
                .await?;
        }
        if to != Address::ZERO {
            self.storage
                .apply_holding_delta(self.chain_id, &self.contract, &token_id, &to, value as i64)
                .await?;
        }

        // Mint adds to a holder and burn removes, so the balance sum
        // is already minted-minus-burned.
        let supply = self
            .storage
            .token_supply(self.chain_id, &self.contract, &token_id)
            .await?;
        let num_owners = self
            .storage
            .token_owner_count(self.chain_id, &self.contract, &token_id)
            .await?;
        self.storage
            .update_item_supply(self.chain_id, &self.contract, &token_id, supply, num_owners, now)
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
impl EventHandler for Erc1155Handler {
    fn name(&self) -> &str {
        "erc1155"
    }

    fn topics(&self) -> Vec<B256> {
        vec![TransferSingle::SIGNATURE_HASH, TransferBatch::SIGNATURE_HASH]
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let topic0 = match envelope.log.inner.topics().first() {
            Some(topic) => *topic,
            None => return Ok(()),
        };

        if topic0 == TransferSingle::SIGNATURE_HASH {
            let decoded = match TransferSingle::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => decoded.data,
                Err(err) => {
                    warn!(
                        block = envelope.block_number(),
                        log_index = envelope.log_index(),
                        "skipping undecodable TransferSingle log: {err}"
                    );
                    return Ok(());
                }
            };
            self.apply_transfer(
                decoded.from,
                decoded.to,
                decoded.id,
                decoded.value.saturating_to(),
                envelope,
            )
            .await
        } else if topic0 == TransferBatch::SIGNATURE_HASH {
            let decoded = match TransferBatch::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => decoded.data,
                Err(err) => {
                    warn!(
                        block = envelope.block_number(),
                        log_index = envelope.log_index(),
                        "skipping undecodable TransferBatch log: {err}"
                    );
                    return Ok(());
                }
            };
            for (id, value) in decoded.ids.iter().zip(decoded.values.iter()) {
                self.apply_transfer(
                    decoded.from,
                    decoded.to,
                    *id,
                    value.saturating_to(),
                    envelope,
                )
                .await?;
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn on_rewind(&self, from_block: u64) -> Result<()> {
        // Holdings move in lockstep with first-seen activity rows, so the
        // rows being dropped tell us exactly which deltas to reverse. The
        // replay of the winning branch then re-applies its own.
        let orphaned = self
            .storage
            .list_chain_transfers_from_block(self.chain_id, &self.contract, from_block)
            .await?;
        let now = chrono::Utc::now().timestamp();
        let mut touched = BTreeSet::new();
        for entry in &orphaned {
            let from = parse_address(&entry.account)?;
            let to = parse_address(&entry.to_account)?;
            let value = entry.quantity as i64;
            if from != Address::ZERO {
                self.storage
                    .apply_holding_delta(self.chain_id, &self.contract, &entry.token_id, &from, value)
                    .await?;
            }
            if to != Address::ZERO {
                self.storage
                    .apply_holding_delta(self.chain_id, &self.contract, &entry.token_id, &to, -value)
                    .await?;
            }
            touched.insert(entry.token_id);
        }
        for token_id in touched {
            let supply = self
                .storage
                .token_supply(self.chain_id, &self.contract, &token_id)
                .await?;
            let num_owners = self
                .storage
                .token_owner_count(self.chain_id, &self.contract, &token_id)
                .await?;
            self.storage
                .update_item_supply(self.chain_id, &self.contract, &token_id, supply, num_owners, now)
                .await?;
        }
        self.storage
            .delete_chain_activity_from_block(self.chain_id, &self.contract, from_block)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{envelope, order_book};
    use crate::storage::test_storage;
    use alloy::primitives::address;

    const CONTRACT: Address = address!("495f947276749ce646f68ac8c248420045cb7b5e");

    fn single(
        from: Address,
        to: Address,
        id: u64,
        value: u64,
        block: u64,
        log_index: u64,
        tx_byte: u8,
    ) -> LogEnvelope {
        let event = TransferSingle {
            operator: Address::from([0x0f; 20]),
            from,
            to,
            id: U256::from(id),
            value: U256::from(value),
        };
        envelope(
            CONTRACT,
            event.encode_log_data(),
            block,
            log_index,
            tx_byte,
            None,
        )
    }

    #[tokio::test]
    async fn test_mint_then_split() {
        let (storage, _temp_db) = test_storage().await;
        let handler =
            Erc1155Handler::new(1, CONTRACT, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let bob = Address::from([0xbb; 20]);

        handler
            .handle(&single(Address::ZERO, alice, 42, 10, 100, 0, 0x01))
            .await
            .unwrap();
        handler
            .handle(&single(alice, bob, 42, 4, 101, 0, 0x02))
            .await
            .unwrap();

        let token_id = U256::from(42u64);
        let a = storage
            .get_holding(1, &CONTRACT, &token_id, &alice)
            .await
            .unwrap()
            .unwrap();
        let b = storage
            .get_holding(1, &CONTRACT, &token_id, &bob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.balance, 6);
        assert_eq!(b.balance, 4);

        let item = storage
            .get_item(1, &CONTRACT, &token_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.supply, 10);
        assert_eq!(item.num_owners, 2);
    }

    #[tokio::test]
    async fn test_full_spend_removes_owner() {
        let (storage, _temp_db) = test_storage().await;
        let handler =
            Erc1155Handler::new(1, CONTRACT, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let bob = Address::from([0xbb; 20]);
        let token_id = U256::from(42u64);

        handler
            .handle(&single(Address::ZERO, alice, 42, 5, 100, 0, 0x01))
            .await
            .unwrap();
        handler
            .handle(&single(alice, bob, 42, 5, 101, 0, 0x02))
            .await
            .unwrap();

        assert!(storage
            .get_holding(1, &CONTRACT, &token_id, &alice)
            .await
            .unwrap()
            .is_none());
        let item = storage.get_item(1, &CONTRACT, &token_id).await.unwrap().unwrap();
        assert_eq!(item.supply, 5);
        assert_eq!(item.num_owners, 1);

        // Burn the rest.
        handler
            .handle(&single(bob, Address::ZERO, 42, 5, 102, 0, 0x03))
            .await
            .unwrap();
        let item = storage.get_item(1, &CONTRACT, &token_id).await.unwrap().unwrap();
        assert_eq!(item.supply, 0);
        assert_eq!(item.num_owners, 0);
    }

    #[tokio::test]
    async fn test_redelivery_leaves_holdings_alone() {
        let (storage, _temp_db) = test_storage().await;
        let handler =
            Erc1155Handler::new(1, CONTRACT, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let mint = single(Address::ZERO, alice, 42, 10, 100, 0, 0x01);
        handler.handle(&mint).await.unwrap();
        handler.handle(&mint).await.unwrap();

        let token_id = U256::from(42u64);
        let holding = storage
            .get_holding(1, &CONTRACT, &token_id, &alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holding.balance, 10);
        let item = storage.get_item(1, &CONTRACT, &token_id).await.unwrap().unwrap();
        assert_eq!(item.supply, 10);
        assert_eq!(item.num_owners, 1);
        let feed = storage
            .list_activity_for_token(1, &CONTRACT, &token_id, 10)
            .await
            .unwrap();
        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn test_rewind_reverses_holdings_before_replay() {
        let (storage, _temp_db) = test_storage().await;
        let handler =
            Erc1155Handler::new(1, CONTRACT, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let bob = Address::from([0xbb; 20]);
        let carol = Address::from([0xcc; 20]);
        let token_id = U256::from(42u64);

        handler
            .handle(&single(Address::ZERO, alice, 42, 10, 100, 0, 0x01))
            .await
            .unwrap();
        // Orphaned branch: alice sends 4 to bob at block 101.
        handler
            .handle(&single(alice, bob, 42, 4, 101, 0, 0x02))
            .await
            .unwrap();

        // Winning branch carries a different split in a different tx.
        handler.on_rewind(101).await.unwrap();
        handler
            .handle(&single(alice, carol, 42, 7, 101, 0, 0x03))
            .await
            .unwrap();

        let a = storage
            .get_holding(1, &CONTRACT, &token_id, &alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.balance, 3);
        assert!(storage
            .get_holding(1, &CONTRACT, &token_id, &bob)
            .await
            .unwrap()
            .is_none());
        let c = storage
            .get_holding(1, &CONTRACT, &token_id, &carol)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.balance, 7);

        let item = storage.get_item(1, &CONTRACT, &token_id).await.unwrap().unwrap();
        assert_eq!(item.supply, 10);
        assert_eq!(item.num_owners, 2);
    }

    #[tokio::test]
    async fn test_batch_transfer_writes_row_per_id() {
        let (storage, _temp_db) = test_storage().await;
        let handler =
            Erc1155Handler::new(1, CONTRACT, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let event = TransferBatch {
            operator: Address::from([0x0f; 20]),
            from: Address::ZERO,
            to: alice,
            ids: vec![U256::from(1u64), U256::from(2u64)],
            values: vec![U256::from(3u64), U256::from(7u64)],
        };
        handler
            .handle(&envelope(CONTRACT, event.encode_log_data(), 100, 0, 0x01, None))
            .await
            .unwrap();

        for (id, supply) in [(1u64, 3u64), (2, 7)] {
            let item = storage
                .get_item(1, &CONTRACT, &U256::from(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(item.supply, supply);
            let feed = storage
                .list_activity_for_token(1, &CONTRACT, &U256::from(id), 10)
                .await
                .unwrap();
            assert_eq!(feed.len(), 1);
            assert_eq!(feed[0].quantity, supply);
        }
    }
}
