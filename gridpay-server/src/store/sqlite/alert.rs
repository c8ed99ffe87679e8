use std::str::FromStr;

use async_trait::async_trait;
use gridpay_core::{
    AccountId, Alert, AlertId, AlertKind, AlertSeverity, DeviceId, EventId, EventLevel, OpsEvent,
};
use sqlx::{Row, SqlitePool};
use ulid::Ulid;

use crate::store::AlertStore;

#[derive(Debug, thiserror::Error)]
pub enum SqliteAlertError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid enum value: {0}")]
    InvalidEnum(String),
}

#[derive(Clone)]
pub struct SqliteAlertStore {
    pool: SqlitePool,
}

impl SqliteAlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    type Error = SqliteAlertError;

    async fn open_if_absent(&self, alert: Alert) -> Result<bool, Self::Error> {
        // The partial unique index on open (account, kind) pairs makes
        // racing inserts collapse to a single winner.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO alerts
                (id, account_id, device_id, kind, severity, message, open, opened_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, NULL)
            "#,
        )
        .bind(alert.id.0.to_string())
        .bind(alert.account_id.0.to_string())
        .bind(alert.device_id.map(|d| d.0.to_string()))
        .bind(kind_to_text(alert.kind))
        .bind(severity_to_text(alert.severity))
        .bind(&*alert.message)
        .bind(alert.opened_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve(
        &self,
        account_id: AccountId,
        kind: AlertKind,
        at: jiff::Timestamp,
    ) -> Result<usize, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE alerts SET open = 0, resolved_at = ?
            WHERE account_id = ? AND kind = ? AND open = 1
            "#,
        )
        .bind(at.as_millisecond())
        .bind(account_id.0.to_string())
        .bind(kind_to_text(kind))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn open_alerts(&self, account_id: AccountId) -> Result<Vec<Alert>, Self::Error> {
        let rows =
            sqlx::query("SELECT * FROM alerts WHERE account_id = ? AND open = 1 ORDER BY opened_at")
                .bind(account_id.0.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(map_row_to_alert).collect()
    }

    async fn record_event(&self, event: OpsEvent) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO ops_events
                (id, account_id, device_id, level, kind, message, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.0.to_string())
        .bind(event.account_id.map(|a| a.0.to_string()))
        .bind(event.device_id.map(|d| d.0.to_string()))
        .bind(level_to_text(event.level))
        .bind(&*event.kind)
        .bind(&*event.message)
        .bind(event.timestamp.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<OpsEvent>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM ops_events ORDER BY timestamp DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(map_row_to_event).collect()
    }
}

fn kind_to_text(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::LowBalance => "low_balance",
        AlertKind::Exhausted => "exhausted",
        AlertKind::DeviceOffline => "device_offline",
    }
}

fn severity_to_text(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "info",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "critical",
    }
}

fn level_to_text(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Info => "info",
        EventLevel::Warn => "warn",
        EventLevel::Error => "error",
    }
}

fn parse_ulid(raw: String) -> Result<Ulid, SqliteAlertError> {
    Ulid::from_str(&raw).map_err(|_| SqliteAlertError::InvalidUlid(raw))
}

fn parse_timestamp(millis: i64) -> Result<jiff::Timestamp, SqliteAlertError> {
    jiff::Timestamp::from_millisecond(millis).map_err(|_| SqliteAlertError::InvalidTimestamp(millis))
}

fn map_row_to_alert(r: &sqlx::sqlite::SqliteRow) -> Result<Alert, SqliteAlertError> {
    let kind = match r.try_get::<String, _>("kind")?.as_str() {
        "low_balance" => AlertKind::LowBalance,
        "exhausted" => AlertKind::Exhausted,
        "device_offline" => AlertKind::DeviceOffline,
        other => return Err(SqliteAlertError::InvalidEnum(other.to_string())),
    };
    let severity = match r.try_get::<String, _>("severity")?.as_str() {
        "info" => AlertSeverity::Info,
        "warning" => AlertSeverity::Warning,
        "critical" => AlertSeverity::Critical,
        other => return Err(SqliteAlertError::InvalidEnum(other.to_string())),
    };

    Ok(Alert {
        id: AlertId(parse_ulid(r.try_get("id")?)?),
        account_id: AccountId(parse_ulid(r.try_get("account_id")?)?),
        device_id: r
            .try_get::<Option<String>, _>("device_id")?
            .map(|raw| parse_ulid(raw).map(DeviceId))
            .transpose()?,
        kind,
        severity,
        message: r.try_get::<String, _>("message")?.into_boxed_str(),
        open: r.try_get("open")?,
        opened_at: parse_timestamp(r.try_get("opened_at")?)?,
        resolved_at: r
            .try_get::<Option<i64>, _>("resolved_at")?
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn map_row_to_event(r: &sqlx::sqlite::SqliteRow) -> Result<OpsEvent, SqliteAlertError> {
    let level = match r.try_get::<String, _>("level")?.as_str() {
        "info" => EventLevel::Info,
        "warn" => EventLevel::Warn,
        "error" => EventLevel::Error,
        other => return Err(SqliteAlertError::InvalidEnum(other.to_string())),
    };

    Ok(OpsEvent {
        id: EventId(parse_ulid(r.try_get("id")?)?),
        account_id: r
            .try_get::<Option<String>, _>("account_id")?
            .map(|raw| parse_ulid(raw).map(AccountId))
            .transpose()?,
        device_id: r
            .try_get::<Option<String>, _>("device_id")?
            .map(|raw| parse_ulid(raw).map(DeviceId))
            .transpose()?,
        level,
        kind: r.try_get::<String, _>("kind")?.into_boxed_str(),
        message: r.try_get::<String, _>("message")?.into_boxed_str(),
        timestamp: parse_timestamp(r.try_get("timestamp")?)?,
    })
}
