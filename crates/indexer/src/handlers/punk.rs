//! CryptoPunks handler.
//!
//! Punks predate ERC-721; ownership moves through three events
//! (`Assign` on claim, `PunkTransfer`, `PunkBought` on a market fill)
//! and the bought event hides the buyer behind the zero address when a
//! standing bid is accepted. The tracker resolves the transaction
//! sender for that case.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use nfttrack_core::{lowercase_address, ActivityKind, ItemId, TokenType};
use tracing::warn;

use super::{EventHandler, LogEnvelope};
use crate::orderbook::OrderBook;
use crate::storage::{ActivityRecord, Storage};

sol! {
    /// Initial claim of a punk.
    event Assign(address indexed to, uint256 punkIndex);

    /// Direct punk transfer.
    event PunkTransfer(address indexed from, address indexed to, uint256 punkIndex);

    /// Market fill on the punks contract. `toAddress` is zero when a
    /// standing bid was accepted; the real buyer is the tx sender.
    event PunkBought(
        uint256 indexed punkIndex,
        uint256 value,
        address indexed fromAddress,
        address indexed toAddress
    );
}

/// Reducer for the CryptoPunks contract.
///
/// Same shape as the ERC-721 handler with `tokenType = punk`.
pub struct PunkHandler {
    chain_id: u64,
    contract: Address,
    storage: Storage,
    orderbook: OrderBook,
}

impl PunkHandler {
    /// Handler for the punks `contract` on `chain_id`.
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
        punk_index: U256,
        envelope: &LogEnvelope,
    ) -> Result<()> {
        let now = envelope.block_time as i64;

        self.storage
            .ensure_collection(self.chain_id, &self.contract, TokenType::Punk, now)
            .await?;
        self.storage
            .ensure_item(self.chain_id, &self.contract, &punk_index, TokenType::Punk, now)
            .await?;
        self.storage
            .set_item_owner(self.chain_id, &self.contract, &punk_index, &to, now)
            .await?;

        let kind = if from == Address::ZERO {
            ActivityKind::Mint
        } else {
            ActivityKind::Transfer
        };
        self.storage
            .insert_activity(&ActivityRecord {
                chain_id: self.chain_id,
                collection: self.contract,
                token_id: punk_index,
                kind,
                account: lowercase_address(&from),
                to_account: lowercase_address(&to),
                quantity: 1,
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

        let id = ItemId::new(self.chain_id, self.contract, punk_index);
        self.orderbook.refresh_orders(&id, now).await?;
        self.orderbook
            .refresh_listing_and_offer_state(&id, now)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PunkHandler {
    fn name(&self) -> &str {
        "punk"
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            Assign::SIGNATURE_HASH,
            PunkTransfer::SIGNATURE_HASH,
            PunkBought::SIGNATURE_HASH,
        ]
    }

    fn wants_tx_sender(&self) -> bool {
        true
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let topic0 = match envelope.log.inner.topics().first() {
            Some(topic) => *topic,
            None => return Ok(()),
        };

        if topic0 == Assign::SIGNATURE_HASH {
            match Assign::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    self.apply_transfer(
                        Address::ZERO,
                        decoded.data.to,
                        decoded.data.punkIndex,
                        envelope,
                    )
                    .await
                }
                Err(err) => {
                    warn!(
                        block = envelope.block_number(),
                        log_index = envelope.log_index(),
                        "skipping undecodable Assign log: {err}"
                    );
                    Ok(())
                }
            }
        } else if topic0 == PunkTransfer::SIGNATURE_HASH {
            match PunkTransfer::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    self.apply_transfer(
                        decoded.data.from,
                        decoded.data.to,
                        decoded.data.punkIndex,
                        envelope,
                    )
                    .await
                }
                Err(err) => {
                    warn!(
                        block = envelope.block_number(),
                        log_index = envelope.log_index(),
                        "skipping undecodable PunkTransfer log: {err}"
                    );
                    Ok(())
                }
            }
        } else if topic0 == PunkBought::SIGNATURE_HASH {
            match PunkBought::decode_log(&envelope.log.inner, true) {
                Ok(decoded) => {
                    let event = decoded.data;
                    let buyer = if event.toAddress == Address::ZERO {
                        match envelope.sender {
                            Some(sender) => sender,
                            None => {
                                warn!(
                                    punk = %event.punkIndex,
                                    "bid-accept fill without resolved sender, keeping zero buyer"
                                );
                                Address::ZERO
                            }
                        }
                    } else {
                        event.toAddress
                    };
                    self.apply_transfer(event.fromAddress, buyer, event.punkIndex, envelope)
                        .await
                }
                Err(err) => {
                    warn!(
                        block = envelope.block_number(),
                        log_index = envelope.log_index(),
                        "skipping undecodable PunkBought log: {err}"
                    );
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }

    async fn on_rewind(&self, from_block: u64) -> Result<()> {
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

    const PUNKS: Address = address!("b47e3cd837ddf8e4c57f05d70ab865de6e193bbb");

    #[tokio::test]
    async fn test_assign_mints_a_punk() {
        let (storage, _temp_db) = test_storage().await;
        let handler = PunkHandler::new(1, PUNKS, storage.clone(), order_book(storage.clone()));

        let alice = Address::from([0xaa; 20]);
        let event = Assign {
            to: alice,
            punkIndex: U256::from(9_999u64),
        };
        handler
            .handle(&envelope(PUNKS, event.encode_log_data(), 100, 0, 0x01, None))
            .await
            .unwrap();

        let item = storage
            .get_item(1, &PUNKS, &U256::from(9_999u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.token_type, TokenType::Punk);
        assert_eq!(item.owner, lowercase_address(&alice));

        let feed = storage
            .list_activity_for_token(1, &PUNKS, &U256::from(9_999u64), 10)
            .await
            .unwrap();
        assert_eq!(feed[0].kind, ActivityKind::Mint);
    }

    #[tokio::test]
    async fn test_bid_accept_resolves_buyer_from_sender() {
        let (storage, _temp_db) = test_storage().await;
        let handler = PunkHandler::new(1, PUNKS, storage.clone(), order_book(storage.clone()));

        let seller = Address::from([0xaa; 20]);
        let buyer = Address::from([0xbb; 20]);
        let event = PunkBought {
            punkIndex: U256::from(1u64),
            value: U256::from(10u64).pow(U256::from(18u64)),
            fromAddress: seller,
            toAddress: Address::ZERO,
        };
        handler
            .handle(&envelope(
                PUNKS,
                event.encode_log_data(),
                100,
                0,
                0x01,
                Some(buyer),
            ))
            .await
            .unwrap();

        let item = storage
            .get_item(1, &PUNKS, &U256::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.owner, lowercase_address(&buyer));
    }
}
