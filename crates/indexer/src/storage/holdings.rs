//! Holding storage operations (ERC-1155 per-owner balances).

use super::{HoldingRecord, Storage};
use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address};
use sqlx::Row;

impl Storage {
    /// Apply a signed balance delta for one `(token, owner)` pair.
    ///
    /// Rows are created on first credit and deleted when the balance drops
    /// to zero, so no zero-balance rows linger. A delta that would drive
    /// the balance negative clamps to zero; log replays after a rewind can
    /// legitimately debit an already-cleared row.
    pub async fn apply_holding_delta(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        owner: &Address,
        delta: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO holdings (chain_id, contract, token_id, owner, balance)
            VALUES (?1, ?2, ?3, ?4, MAX(0, ?5))
            ON CONFLICT(chain_id, contract, token_id, owner)
            DO UPDATE SET balance = MAX(0, holdings.balance + ?5)
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .bind(lowercase_address(owner))
        .bind(delta)
        .execute(&self.pool)
        .await
        .context("Failed to apply holding delta")?;

        sqlx::query(
            r#"
            DELETE FROM holdings
            WHERE chain_id = ? AND contract = ? AND token_id = ? AND owner = ? AND balance <= 0
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .bind(lowercase_address(owner))
        .execute(&self.pool)
        .await
        .context("Failed to prune empty holding")?;

        Ok(())
    }

    /// Fetch one holding row, if present.
    pub async fn get_holding(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
        owner: &Address,
    ) -> Result<Option<HoldingRecord>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, contract, token_id, owner, balance
            FROM holdings
            WHERE chain_id = ? AND contract = ? AND token_id = ? AND owner = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .bind(lowercase_address(owner))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_holding).transpose()
    }

    /// Sum of balances across owners for one token.
    pub async fn token_supply(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
    ) -> Result<u64> {
        let sum: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(balance) FROM holdings
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(sum.unwrap_or(0) as u64)
    }

    /// Number of owners with a positive balance for one token.
    pub async fn token_owner_count(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM holdings
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    /// Distinct owners across a whole multi-token collection.
    pub async fn collection_holder_count(
        &self,
        chain_id: u64,
        contract: &Address,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT owner) FROM holdings
            WHERE chain_id = ? AND contract = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    /// All holders of one token.
    pub async fn list_token_holders(
        &self,
        chain_id: u64,
        contract: &Address,
        token_id: &U256,
    ) -> Result<Vec<HoldingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT chain_id, contract, token_id, owner, balance
            FROM holdings
            WHERE chain_id = ? AND contract = ? AND token_id = ?
            ORDER BY owner
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(contract))
        .bind(token_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_holding).collect()
    }

    fn row_to_holding(row: sqlx::sqlite::SqliteRow) -> Result<HoldingRecord> {
        let contract: String = row.get("contract");
        let token_id: String = row.get("token_id");
        let owner: String = row.get("owner");

        Ok(HoldingRecord {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            contract: parse_address(&contract)?,
            token_id: token_id
                .parse::<U256>()
                .map_err(|e| anyhow::anyhow!("Invalid token id in database: {e}"))?,
            owner: parse_address(&owner)?,
            balance: row.get::<i64, _>("balance") as u64,
        })
    }
}
