//! Manifold royalty registry handler.
//!
//! Records per-collection royalty overrides as they are announced on
//! chain. The override is stored as a JSON blob on the collection row;
//! the sale path reads it for display only, fee routing happens on
//! chain.

use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::Result;
use async_trait::async_trait;
use nfttrack_core::lowercase_address;
use serde_json::json;
use tracing::warn;

use super::{EventHandler, LogEnvelope};
use crate::storage::Storage;

sol! {
    event RoyaltiesUpdated(address indexed tokenAddress, address[] receivers, uint256[] basisPoints);
}

/// Reducer for the royalty registry contract.
pub struct RoyaltyHandler {
    chain_id: u64,
    storage: Storage,
}

impl RoyaltyHandler {
    /// Handler for the registry on `chain_id`.
    pub fn new(chain_id: u64, storage: Storage) -> Self {
        Self { chain_id, storage }
    }
}

#[async_trait]
impl EventHandler for RoyaltyHandler {
    fn name(&self) -> &str {
        "royalty"
    }

    fn topics(&self) -> Vec<B256> {
        vec![RoyaltiesUpdated::SIGNATURE_HASH]
    }

    async fn handle(&self, envelope: &LogEnvelope) -> Result<()> {
        let decoded = match RoyaltiesUpdated::decode_log(&envelope.log.inner, true) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("skipping undecodable RoyaltiesUpdated log: {err}");
                return Ok(());
            }
        };
        let event = decoded.data;

        let entries: Vec<_> = event
            .receivers
            .iter()
            .zip(event.basisPoints.iter())
            .map(|(receiver, bps)| {
                json!({
                    "receiver": lowercase_address(receiver),
                    "fee_bps": bps.saturating_to::<u64>(),
                })
            })
            .collect();
        let blob = serde_json::to_string(&entries)?;

        self.storage
            .set_collection_royalty(
                self.chain_id,
                &event.tokenAddress,
                &blob,
                envelope.block_time as i64,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::envelope;
    use crate::storage::test_storage;
    use alloy::primitives::{address, Address, U256};
    use nfttrack_core::TokenType;

    const REGISTRY: Address = address!("0385603ab55642cb4dd5de3ae9e306809991804f");
    const COLLECTION: Address = address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d");

    #[tokio::test]
    async fn test_override_lands_on_collection_row() {
        let (storage, _temp_db) = test_storage().await;
        storage
            .ensure_collection(1, &COLLECTION, TokenType::Erc721, 100)
            .await
            .unwrap();

        let handler = RoyaltyHandler::new(1, storage.clone());
        let receiver = Address::from([0xcc; 20]);
        let event = RoyaltiesUpdated {
            tokenAddress: COLLECTION,
            receivers: vec![receiver],
            basisPoints: vec![U256::from(500u64)],
        };
        handler
            .handle(&envelope(REGISTRY, event.encode_log_data(), 100, 0, 0x01, None))
            .await
            .unwrap();

        let collection = storage.get_collection(1, &COLLECTION).await.unwrap().unwrap();
        let blob = collection.royalty_override.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed[0]["fee_bps"], 500);
        assert_eq!(parsed[0]["receiver"], lowercase_address(&receiver));
    }
}
