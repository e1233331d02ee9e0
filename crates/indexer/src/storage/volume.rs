//! Trading volume and floor price history storage operations.

use super::{FloorPriceRecord, Storage, VolumeRecord};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use nfttrack_core::{lowercase_address, parse_address, TradingPeriod};
use sqlx::Row;

impl Storage {
    /// Add a sale into the volume bucket of one period.
    ///
    /// `date` must already be truncated with [`TradingPeriod::truncate`].
    pub async fn add_trading_volume(
        &self,
        chain_id: u64,
        address: &Address,
        period: TradingPeriod,
        date: i64,
        volume: f64,
        volume_in_usd: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_volume (chain_id, address, period, date, volume, volume_in_usd)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(chain_id, address, period, date) DO UPDATE SET
                volume = volume + ?5,
                volume_in_usd = volume_in_usd + ?6
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(period.as_str())
        .bind(date)
        .bind(volume)
        .bind(volume_in_usd)
        .execute(&self.pool)
        .await
        .context("Failed to add trading volume")?;

        Ok(())
    }

    /// Fetch one volume bucket.
    pub async fn get_trading_volume(
        &self,
        chain_id: u64,
        address: &Address,
        period: TradingPeriod,
        date: i64,
    ) -> Result<Option<VolumeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, address, period, date, volume, volume_in_usd
            FROM trading_volume
            WHERE chain_id = ? AND address = ? AND period = ? AND date = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(period.as_str())
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let address: String = row.get("address");
            Ok(VolumeRecord {
                chain_id: row.get::<i64, _>("chain_id") as u64,
                address: parse_address(&address)?,
                period: row.get("period"),
                date: row.get("date"),
                volume: row.get("volume"),
                volume_in_usd: row.get("volume_in_usd"),
            })
        })
        .transpose()
    }

    /// Upsert the daily floor price sample of a collection.
    pub async fn upsert_floor_price(&self, record: &FloorPriceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO floor_price_history (
                chain_id, address, date,
                price_in_native, price_in_usd, num_owners,
                opensea_price_in_native, opensea_price_in_usd
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chain_id, address, date) DO UPDATE SET
                price_in_native = excluded.price_in_native,
                price_in_usd = excluded.price_in_usd,
                num_owners = excluded.num_owners,
                opensea_price_in_native = excluded.opensea_price_in_native,
                opensea_price_in_usd = excluded.opensea_price_in_usd
            "#,
        )
        .bind(record.chain_id as i64)
        .bind(lowercase_address(&record.address))
        .bind(record.date)
        .bind(record.price_in_native)
        .bind(record.price_in_usd)
        .bind(record.num_owners as i64)
        .bind(record.opensea_price_in_native)
        .bind(record.opensea_price_in_usd)
        .execute(&self.pool)
        .await
        .context("Failed to upsert floor price")?;

        Ok(())
    }

    /// Fetch one day's floor price sample.
    pub async fn get_floor_price(
        &self,
        chain_id: u64,
        address: &Address,
        date: i64,
    ) -> Result<Option<FloorPriceRecord>> {
        let row = sqlx::query(
            r#"
            SELECT chain_id, address, date,
                   price_in_native, price_in_usd, num_owners,
                   opensea_price_in_native, opensea_price_in_usd
            FROM floor_price_history
            WHERE chain_id = ? AND address = ? AND date = ?
            "#,
        )
        .bind(chain_id as i64)
        .bind(lowercase_address(address))
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let address: String = row.get("address");
            Ok(FloorPriceRecord {
                chain_id: row.get::<i64, _>("chain_id") as u64,
                address: parse_address(&address)?,
                date: row.get("date"),
                price_in_native: row.get("price_in_native"),
                price_in_usd: row.get("price_in_usd"),
                num_owners: row.get::<i64, _>("num_owners") as u64,
                opensea_price_in_native: row.get("opensea_price_in_native"),
                opensea_price_in_usd: row.get("opensea_price_in_usd"),
            })
        })
        .transpose()
    }
}
