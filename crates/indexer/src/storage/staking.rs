//! ApeCoin staking flag storage operations.

use super::{StakingRecord, Storage};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address};
use sqlx::Row;

impl Storage {
    /// Set or clear the staked flag for one token.
    pub async fn set_token_staked(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        staked: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO apecoin_staking (chain_id, contract, token_id, staked)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chain_id, contract, token_id) DO UPDATE SET
                staked = excluded.staked
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .bind(staked)
        .execute(&self.pool)
        .await
        .context("Failed to set staking flag")?;

        Ok(())
    }

    /// Whether a token currently backs a staking position.
    pub async fn is_token_staked(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
    ) -> Result<bool> {
        let staked: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT staked FROM apecoin_staking
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(staked.unwrap_or(false))
    }

    /// All staked tokens of a collection.
    pub async fn list_staked_tokens(
        &self,
        chain_id: u64,
        contract: &Address,
    ) -> Result<Vec<StakingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, contract, token_id, staked FROM apecoin_staking
            WHERE chain_id = ? AND contract = ? AND staked = 1
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let contract: String = row.get("contract");
                let token_id: String = row.get("token_id");
                Ok(StakingRecord {
                    chain_id: row.get::<i64, _>("chain_id") as u64,
                    contract: parse_address(&contract)?,
                    token_id: token_id
                        .parse::<U256>()
                        .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?,
                    staked: row.get("staked"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_storage;
    use alloy::primitives::address;

    const BAYC: Address = address!("0000000000000000000000000000000000000301");

    #[tokio::test]
    async fn test_staking_flag_roundtrip() {
        let (storage, _temp_db) = test_storage().await;
        let token = U256::from(1);

        assert!(!storage.is_token_staked(1, &BAYC, &token).await.unwrap());

        storage.set_token_staked(1, &BAYC, &token, true).await.unwrap();
        assert!(storage.is_token_staked(1, &BAYC, &token).await.unwrap());
        assert_eq!(storage.list_staked_tokens(1, &BAYC).await.unwrap().len(), 1);

        storage.set_token_staked(1, &BAYC, &token, false).await.unwrap();
        assert!(!storage.is_token_staked(1, &BAYC, &token).await.unwrap());
        assert!(storage.list_staked_tokens(1, &BAYC).await.unwrap().is_empty());
    }
}
