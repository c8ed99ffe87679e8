use std::str::FromStr;

use async_trait::async_trait;
use gridpay_core::{
    Account, AccountId, BillingTransaction, DeviceId, Kwh, ReadingId, Tariff, TariffId,
    TransactionId,
};
use ordered_float::NotNan;
use sqlx::{Row, SqlitePool};
use ulid::Ulid;

use crate::store::LedgerStore;

#[derive(Debug, thiserror::Error)]
pub enum SqliteLedgerError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    type Error = SqliteLedgerError;

    async fn add_account(&self, account: Account) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO accounts
                (id, name, allocated_kwh, used_kwh, active, locked, provisioned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.id.0.to_string())
        .bind(&*account.name)
        .bind(account.allocated_kwh.into_inner())
        .bind(account.used_kwh.into_inner())
        .bind(account.active)
        .bind(account.locked)
        .bind(account.provisioned_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, Self::Error> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_row_to_account(&r)).transpose()
    }

    async fn add_used(&self, id: AccountId, delta: Kwh) -> Result<Option<Account>, Self::Error> {
        // Single-statement read-modify-write: concurrent debits against
        // the same account serialize at the row.
        let result = sqlx::query("UPDATE accounts SET used_kwh = used_kwh + ? WHERE id = ?")
            .bind(delta.into_inner())
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.account(id).await
    }

    async fn add_allocated(
        &self,
        id: AccountId,
        amount: Kwh,
    ) -> Result<Option<Account>, Self::Error> {
        let result = sqlx::query(
            "UPDATE accounts SET allocated_kwh = allocated_kwh + ?, locked = 0 WHERE id = ?",
        )
        .bind(amount.into_inner())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.account(id).await
    }

    async fn set_locked(&self, id: AccountId, locked: bool) -> Result<(), Self::Error> {
        sqlx::query("UPDATE accounts SET locked = ? WHERE id = ?")
            .bind(locked)
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn add_tariff(&self, tariff: Tariff) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tariffs
                (id, name, grid_rate, generator_rate, active, effective_from, effective_to)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tariff.id.0.to_string())
        .bind(&*tariff.name)
        .bind(tariff.grid_rate.into_inner())
        .bind(tariff.generator_rate.into_inner())
        .bind(tariff.active)
        .bind(tariff.effective_from.as_millisecond())
        .bind(tariff.effective_to.map(|t| t.as_millisecond()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn tariff_at(&self, at: jiff::Timestamp) -> Result<Option<Tariff>, Self::Error> {
        let millis = at.as_millisecond();

        let in_window = sqlx::query(
            r#"
            SELECT * FROM tariffs
            WHERE active = 1 AND effective_from <= ?
              AND (effective_to IS NULL OR effective_to > ?)
            ORDER BY effective_from DESC LIMIT 1
            "#,
        )
        .bind(millis)
        .bind(millis)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = in_window {
            return Ok(Some(map_row_to_tariff(&row)?));
        }

        let fallback = sqlx::query(
            "SELECT * FROM tariffs WHERE active = 1 ORDER BY effective_from DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        fallback.map(|r| map_row_to_tariff(&r)).transpose()
    }

    async fn insert_transaction(&self, tx: BillingTransaction) -> Result<bool, Self::Error> {
        // The unique reading_id index makes re-application a no-op.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO billing_transactions
                (id, reading_id, account_id, device_id, tariff_id, delta_kwh, cost, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.id.0.to_string())
        .bind(tx.reading_id.0.to_string())
        .bind(tx.account_id.0.to_string())
        .bind(tx.device_id.0.to_string())
        .bind(tx.tariff_id.0.to_string())
        .bind(tx.delta_kwh.into_inner())
        .bind(tx.cost.into_inner())
        .bind(tx.recorded_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transaction_for_reading(
        &self,
        reading_id: ReadingId,
    ) -> Result<Option<BillingTransaction>, Self::Error> {
        let row = sqlx::query("SELECT * FROM billing_transactions WHERE reading_id = ?")
            .bind(reading_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_row_to_transaction(&r)).transpose()
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<BillingTransaction>, Self::Error> {
        let rows = sqlx::query(
            "SELECT * FROM billing_transactions WHERE account_id = ? ORDER BY recorded_at",
        )
        .bind(account_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_transaction).collect()
    }
}

fn parse_ulid(raw: String) -> Result<Ulid, SqliteLedgerError> {
    Ulid::from_str(&raw).map_err(|_| SqliteLedgerError::InvalidUlid(raw))
}

fn parse_timestamp(millis: i64) -> Result<jiff::Timestamp, SqliteLedgerError> {
    jiff::Timestamp::from_millisecond(millis)
        .map_err(|_| SqliteLedgerError::InvalidTimestamp(millis))
}

fn not_nan(value: f64) -> NotNan<f64> {
    NotNan::new(value).expect("database should not contain NaN")
}

fn map_row_to_account(r: &sqlx::sqlite::SqliteRow) -> Result<Account, SqliteLedgerError> {
    Ok(Account {
        id: AccountId(parse_ulid(r.try_get("id")?)?),
        name: r.try_get::<String, _>("name")?.into_boxed_str(),
        allocated_kwh: not_nan(r.try_get("allocated_kwh")?),
        used_kwh: not_nan(r.try_get("used_kwh")?),
        active: r.try_get("active")?,
        locked: r.try_get("locked")?,
        provisioned_at: parse_timestamp(r.try_get("provisioned_at")?)?,
    })
}

fn map_row_to_tariff(r: &sqlx::sqlite::SqliteRow) -> Result<Tariff, SqliteLedgerError> {
    Ok(Tariff {
        id: TariffId(parse_ulid(r.try_get("id")?)?),
        name: r.try_get::<String, _>("name")?.into_boxed_str(),
        grid_rate: not_nan(r.try_get("grid_rate")?),
        generator_rate: not_nan(r.try_get("generator_rate")?),
        active: r.try_get("active")?,
        effective_from: parse_timestamp(r.try_get("effective_from")?)?,
        effective_to: r
            .try_get::<Option<i64>, _>("effective_to")?
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn map_row_to_transaction(
    r: &sqlx::sqlite::SqliteRow,
) -> Result<BillingTransaction, SqliteLedgerError> {
    Ok(BillingTransaction {
        id: TransactionId(parse_ulid(r.try_get("id")?)?),
        reading_id: ReadingId(parse_ulid(r.try_get("reading_id")?)?),
        account_id: AccountId(parse_ulid(r.try_get("account_id")?)?),
        device_id: DeviceId(parse_ulid(r.try_get("device_id")?)?),
        tariff_id: TariffId(parse_ulid(r.try_get("tariff_id")?)?),
        delta_kwh: not_nan(r.try_get("delta_kwh")?),
        cost: not_nan(r.try_get("cost")?),
        recorded_at: parse_timestamp(r.try_get("recorded_at")?)?,
    })
}
