use std::str::FromStr;

use async_trait::async_trait;
use gridpay_core::{
    AccountId, Connectivity, Device, DeviceId, DeviceState, Kwh, MeterReading, ReadingId,
    ReadingQuality,
};
use ordered_float::NotNan;
use sqlx::{Row, SqlitePool};
use ulid::Ulid;

use crate::store::MeterStore;

#[derive(Debug, thiserror::Error)]
pub enum SqliteMeterError {
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
pub struct SqliteMeterStore {
    pool: SqlitePool,
}

impl SqliteMeterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeterStore for SqliteMeterStore {
    type Error = SqliteMeterError;

    async fn add_device(&self, device: Device) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO devices
                (id, account_id, serial, address, unit_id, state, breaker_coil,
                 breaker_enabled, auto_disconnect, last_breaker_state,
                 connectivity, last_seen, provisioned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device.id.0.to_string())
        .bind(device.account_id.0.to_string())
        .bind(&*device.serial)
        .bind(&*device.address)
        .bind(device.unit_id as i32)
        .bind(state_to_text(device.state))
        .bind(device.breaker_coil.map(|c| c as i32))
        .bind(device.breaker_enabled)
        .bind(device.auto_disconnect)
        .bind(device.last_breaker_state)
        .bind(connectivity_to_text(device.connectivity))
        .bind(device.last_seen.map(|t| t.as_millisecond()))
        .bind(device.provisioned_at.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn device(&self, id: DeviceId) -> Result<Option<Device>, Self::Error> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_row_to_device(&r)).transpose()
    }

    async fn update_device(&self, id: DeviceId, new: Device) -> Result<(), Self::Error> {
        let mut device = new;
        device.id = id;
        self.add_device(device).await
    }

    async fn devices_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Device>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM devices WHERE account_id = ?")
            .bind(account_id.0.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(map_row_to_device).collect()
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Self::Error> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY provisioned_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(map_row_to_device).collect()
    }

    async fn insert_reading(&self, reading: MeterReading) -> Result<bool, Self::Error> {
        // The unique (device_id, timestamp) index absorbs redelivery.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO readings
                (id, device_id, timestamp, energy_kwh, grid_kwh, generator_kwh,
                 power_kw, voltage, current, frequency, power_factor,
                 delta_kwh, quality)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.id.0.to_string())
        .bind(reading.device_id.0.to_string())
        .bind(reading.timestamp.as_millisecond())
        .bind(reading.energy_kwh.into_inner())
        .bind(reading.grid_kwh.map(NotNan::into_inner))
        .bind(reading.generator_kwh.map(NotNan::into_inner))
        .bind(reading.power_kw.map(NotNan::into_inner))
        .bind(reading.voltage.map(NotNan::into_inner))
        .bind(reading.current.map(NotNan::into_inner))
        .bind(reading.frequency.map(NotNan::into_inner))
        .bind(reading.power_factor.map(NotNan::into_inner))
        .bind(reading.delta_kwh.into_inner())
        .bind(quality_to_text(reading.quality))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_reading(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<MeterReading>, Self::Error> {
        let row = sqlx::query(
            "SELECT * FROM readings WHERE device_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(device_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_row_to_reading(&r)).transpose()
    }

    async fn readings_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Vec<MeterReading>, Self::Error> {
        let rows = sqlx::query(
            "SELECT * FROM readings WHERE device_id = ? AND timestamp >= ? ORDER BY timestamp",
        )
        .bind(device_id.0.to_string())
        .bind(since.as_millisecond())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_reading).collect()
    }

    async fn consumption_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Kwh, Self::Error> {
        let total: f64 = sqlx::query(
            "SELECT COALESCE(SUM(delta_kwh), 0) FROM readings WHERE device_id = ? AND timestamp >= ?",
        )
        .bind(device_id.0.to_string())
        .bind(since.as_millisecond())
        .fetch_one(&self.pool)
        .await?
        .try_get(0)?;

        Ok(NotNan::new(total).expect("database should not contain NaN"))
    }

    async fn mark_seen(&self, id: DeviceId, at: jiff::Timestamp) -> Result<(), Self::Error> {
        sqlx::query("UPDATE devices SET last_seen = ?, connectivity = 'online' WHERE id = ?")
            .bind(at.as_millisecond())
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_offline(
        &self,
        stale_before: jiff::Timestamp,
    ) -> Result<Vec<Device>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM devices
            WHERE connectivity = 'online' AND last_seen IS NOT NULL AND last_seen < ?
            "#,
        )
        .bind(stale_before.as_millisecond())
        .fetch_all(&self.pool)
        .await?;

        let stale: Vec<Device> = rows
            .iter()
            .map(map_row_to_device)
            .collect::<Result<_, _>>()?;

        sqlx::query(
            r#"
            UPDATE devices SET connectivity = 'offline'
            WHERE connectivity = 'online' AND last_seen IS NOT NULL AND last_seen < ?
            "#,
        )
        .bind(stale_before.as_millisecond())
        .execute(&self.pool)
        .await?;

        Ok(stale)
    }

    async fn set_breaker_state(&self, id: DeviceId, state: bool) -> Result<(), Self::Error> {
        sqlx::query("UPDATE devices SET last_breaker_state = ? WHERE id = ?")
            .bind(state)
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn state_to_text(state: DeviceState) -> &'static str {
    match state {
        DeviceState::Active => "active",
        DeviceState::Disabled => "disabled",
    }
}

fn connectivity_to_text(connectivity: Connectivity) -> &'static str {
    match connectivity {
        Connectivity::Unknown => "unknown",
        Connectivity::Online => "online",
        Connectivity::Offline => "offline",
        Connectivity::Error => "error",
    }
}

fn quality_to_text(quality: ReadingQuality) -> &'static str {
    match quality {
        ReadingQuality::Good => "good",
        ReadingQuality::Suspect => "suspect",
        ReadingQuality::Bad => "bad",
    }
}

fn parse_ulid(raw: String) -> Result<Ulid, SqliteMeterError> {
    Ulid::from_str(&raw).map_err(|_| SqliteMeterError::InvalidUlid(raw))
}

fn parse_timestamp(millis: i64) -> Result<jiff::Timestamp, SqliteMeterError> {
    jiff::Timestamp::from_millisecond(millis).map_err(|_| SqliteMeterError::InvalidTimestamp(millis))
}

fn not_nan(value: f64) -> NotNan<f64> {
    NotNan::new(value).expect("database should not contain NaN")
}

fn map_row_to_device(r: &sqlx::sqlite::SqliteRow) -> Result<Device, SqliteMeterError> {
    let state = match r.try_get::<String, _>("state")?.as_str() {
        "active" => DeviceState::Active,
        "disabled" => DeviceState::Disabled,
        other => return Err(SqliteMeterError::InvalidEnum(other.to_string())),
    };
    let connectivity = match r.try_get::<String, _>("connectivity")?.as_str() {
        "unknown" => Connectivity::Unknown,
        "online" => Connectivity::Online,
        "offline" => Connectivity::Offline,
        "error" => Connectivity::Error,
        other => return Err(SqliteMeterError::InvalidEnum(other.to_string())),
    };

    Ok(Device {
        id: DeviceId(parse_ulid(r.try_get("id")?)?),
        account_id: AccountId(parse_ulid(r.try_get("account_id")?)?),
        serial: r.try_get::<String, _>("serial")?.into_boxed_str(),
        address: r.try_get::<String, _>("address")?.into_boxed_str(),
        unit_id: r.try_get::<i32, _>("unit_id")? as u8,
        state,
        breaker_coil: r.try_get::<Option<i32>, _>("breaker_coil")?.map(|c| c as u16),
        breaker_enabled: r.try_get("breaker_enabled")?,
        auto_disconnect: r.try_get("auto_disconnect")?,
        last_breaker_state: r.try_get("last_breaker_state")?,
        connectivity,
        last_seen: r
            .try_get::<Option<i64>, _>("last_seen")?
            .map(parse_timestamp)
            .transpose()?,
        provisioned_at: parse_timestamp(r.try_get("provisioned_at")?)?,
    })
}

fn map_row_to_reading(r: &sqlx::sqlite::SqliteRow) -> Result<MeterReading, SqliteMeterError> {
    let quality = match r.try_get::<String, _>("quality")?.as_str() {
        "good" => ReadingQuality::Good,
        "suspect" => ReadingQuality::Suspect,
        "bad" => ReadingQuality::Bad,
        other => return Err(SqliteMeterError::InvalidEnum(other.to_string())),
    };

    Ok(MeterReading {
        id: ReadingId(parse_ulid(r.try_get("id")?)?),
        device_id: DeviceId(parse_ulid(r.try_get("device_id")?)?),
        timestamp: parse_timestamp(r.try_get("timestamp")?)?,
        energy_kwh: not_nan(r.try_get("energy_kwh")?),
        grid_kwh: r.try_get::<Option<f64>, _>("grid_kwh")?.map(not_nan),
        generator_kwh: r.try_get::<Option<f64>, _>("generator_kwh")?.map(not_nan),
        power_kw: r.try_get::<Option<f64>, _>("power_kw")?.map(not_nan),
        voltage: r.try_get::<Option<f64>, _>("voltage")?.map(not_nan),
        current: r.try_get::<Option<f64>, _>("current")?.map(not_nan),
        frequency: r.try_get::<Option<f64>, _>("frequency")?.map(not_nan),
        power_factor: r.try_get::<Option<f64>, _>("power_factor")?.map(not_nan),
        delta_kwh: not_nan(r.try_get("delta_kwh")?),
        quality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::open_pool_in_memory;

    fn kwh(v: f64) -> Kwh {
        NotNan::new(v).unwrap()
    }

    fn mock_device(account_id: AccountId) -> Device {
        Device {
            id: DeviceId(Ulid::new()),
            account_id,
            serial: "PAC-001".into(),
            address: "10.0.0.17".into(),
            unit_id: 1,
            state: DeviceState::Active,
            breaker_coil: Some(5),
            breaker_enabled: true,
            auto_disconnect: true,
            last_breaker_state: None,
            connectivity: Connectivity::Unknown,
            last_seen: None,
            provisioned_at: jiff::Timestamp::now(),
        }
    }

    fn mock_reading(device_id: DeviceId, ts: &str, total: f64, delta: f64) -> MeterReading {
        MeterReading {
            id: ReadingId(Ulid::new()),
            device_id,
            timestamp: ts.parse().unwrap(),
            energy_kwh: kwh(total),
            grid_kwh: None,
            generator_kwh: None,
            power_kw: None,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            delta_kwh: kwh(delta),
            quality: ReadingQuality::Good,
        }
    }

    #[tokio::test]
    async fn store_and_get_device_roundtrip() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteMeterStore::new(pool);

        let device = mock_device(AccountId(Ulid::new()));
        let id = device.id;
        store.add_device(device).await.unwrap();

        let fetched = store.device(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.breaker_coil, Some(5));
        assert_eq!(fetched.connectivity, Connectivity::Unknown);
    }

    #[tokio::test]
    async fn reading_insert_dedupes_on_device_and_timestamp() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteMeterStore::new(pool);
        let device_id = DeviceId(Ulid::new());

        let first = mock_reading(device_id, "2025-03-01T10:00:00Z", 100.0, 0.0);
        let duplicate = mock_reading(device_id, "2025-03-01T10:00:00Z", 100.0, 0.0);

        assert!(store.insert_reading(first).await.unwrap());
        assert!(!store.insert_reading(duplicate).await.unwrap());
    }

    #[tokio::test]
    async fn latest_reading_orders_by_timestamp() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteMeterStore::new(pool);
        let device_id = DeviceId(Ulid::new());

        store
            .insert_reading(mock_reading(device_id, "2025-03-01T10:00:00Z", 100.0, 0.0))
            .await
            .unwrap();
        store
            .insert_reading(mock_reading(device_id, "2025-03-01T11:00:00Z", 101.5, 1.5))
            .await
            .unwrap();

        let latest = store.latest_reading(device_id).await.unwrap().unwrap();
        assert_eq!(latest.energy_kwh, kwh(101.5));

        let total = store
            .consumption_since(device_id, "2025-03-01T00:00:00Z".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(total, kwh(1.5));
    }

    #[tokio::test]
    async fn offline_sweep_flips_stale_online_devices() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteMeterStore::new(pool);

        let device = mock_device(AccountId(Ulid::new()));
        let id = device.id;
        store.add_device(device).await.unwrap();
        store
            .mark_seen(id, "2025-03-01T10:00:00Z".parse().unwrap())
            .await
            .unwrap();

        let transitioned = store
            .mark_offline("2025-03-01T11:00:00Z".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(transitioned.len(), 1);

        let fetched = store.device(id).await.unwrap().unwrap();
        assert_eq!(fetched.connectivity, Connectivity::Offline);

        // A second sweep finds nothing: the device is no longer online.
        let again = store
            .mark_offline("2025-03-01T12:00:00Z".parse().unwrap())
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
