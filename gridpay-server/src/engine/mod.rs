mod balance;
mod billing;
mod commands;
mod ingest;

pub use balance::{BalanceOutcome, Recharged};
pub use commands::{EnqueuedCommand, PendingCommand, ResultAck};
pub use ingest::{IngestOutcome, IngestReading, RejectReason};

use gridpay_core::{
    AccountId, AccountStatus, Alert, CommandId, Connectivity, Device, DeviceId, EventId,
    EventLevel, Kwh, MeterReading, OpsEvent,
};
use ulid::Ulid;

use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

/// Typed failures surfaced to callers. Idempotency conflicts are not
/// errors; they come back as no-op outcomes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("account {0:?} not found")]
    AccountNotFound(AccountId),
    #[error("device {0:?} not found")]
    DeviceNotFound(DeviceId),
    #[error("device {0:?} is disabled")]
    DeviceDisabled(DeviceId),
    #[error("command {0:?} not found")]
    CommandNotFound(CommandId),
    #[error("recharge amount must be a positive energy quantity")]
    InvalidRecharge,
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub(crate) fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EngineError::Storage(Box::new(err))
    }
}

/// The metering-to-billing pipeline and breaker-command lifecycle.
///
/// Holds no state of its own and takes no locks: device and account
/// identities partition concurrent work, and the single-row mutations in
/// the stores serialize the rest.
#[derive(Clone)]
pub struct Engine<M, L, A, C> {
    pub meters: M,
    pub ledger: L,
    pub alerts: A,
    pub commands: C,
}

impl<M, L, A, C> Engine<M, L, A, C>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    pub fn new(meters: M, ledger: L, alerts: A, commands: C) -> Self {
        Self {
            meters,
            ledger,
            alerts,
            commands,
        }
    }

    pub(crate) async fn record_event(
        &self,
        level: EventLevel,
        kind: &str,
        message: String,
        account_id: Option<AccountId>,
        device_id: Option<DeviceId>,
    ) -> Result<(), EngineError> {
        self.alerts
            .record_event(OpsEvent {
                id: EventId(Ulid::new()),
                account_id,
                device_id,
                level,
                kind: kind.into(),
                message: message.into_boxed_str(),
                timestamp: jiff::Timestamp::now(),
            })
            .await
            .map_err(EngineError::storage)
    }

    /// Read-only projection of an account for display.
    pub async fn account_overview(
        &self,
        account_id: AccountId,
    ) -> Result<AccountOverview, EngineError> {
        let account = self
            .ledger
            .account(account_id)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::AccountNotFound(account_id))?;

        let devices = self
            .meters
            .devices_for_account(account_id)
            .await
            .map_err(EngineError::storage)?;

        let midnight = start_of_today();
        let mut today_kwh = Kwh::default();
        for device in &devices {
            today_kwh += self
                .meters
                .consumption_since(device.id, midnight)
                .await
                .map_err(EngineError::storage)?;
        }

        let open_alerts = self
            .alerts
            .open_alerts(account_id)
            .await
            .map_err(EngineError::storage)?
            .len();

        Ok(AccountOverview {
            account_id,
            name: account.name.to_string(),
            status: account.status(),
            allocated_kwh: account.allocated_kwh,
            used_kwh: account.used_kwh,
            remaining_kwh: account.remaining_kwh(),
            today_kwh,
            device_count: devices.len(),
            open_alerts,
        })
    }

    /// Connectivity and last-reading summaries for every device.
    pub async fn device_overviews(&self) -> Result<Vec<DeviceOverview>, EngineError> {
        let devices = self
            .meters
            .list_devices()
            .await
            .map_err(EngineError::storage)?;

        let mut overviews = Vec::with_capacity(devices.len());
        for device in devices {
            let latest = self
                .meters
                .latest_reading(device.id)
                .await
                .map_err(EngineError::storage)?;
            overviews.push(DeviceOverview::from_parts(device, latest));
        }
        Ok(overviews)
    }

    pub async fn device_overview(
        &self,
        device_id: DeviceId,
    ) -> Result<DeviceOverview, EngineError> {
        let device = self
            .meters
            .device(device_id)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::DeviceNotFound(device_id))?;
        let latest = self
            .meters
            .latest_reading(device_id)
            .await
            .map_err(EngineError::storage)?;
        Ok(DeviceOverview::from_parts(device, latest))
    }

    pub async fn open_alerts(&self, account_id: AccountId) -> Result<Vec<Alert>, EngineError> {
        self.alerts
            .open_alerts(account_id)
            .await
            .map_err(EngineError::storage)
    }

    /// Connectivity sweep: flip devices that have gone quiet to offline
    /// and raise a deduplicated offline alert for each owning account.
    pub async fn sweep_offline(
        &self,
        stale_before: jiff::Timestamp,
    ) -> Result<usize, EngineError> {
        let stale = self
            .meters
            .mark_offline(stale_before)
            .await
            .map_err(EngineError::storage)?;

        for device in &stale {
            tracing::warn!(device_id = ?device.id, last_seen = ?device.last_seen, "device went offline");
            let opened = self
                .alerts
                .open_if_absent(Alert {
                    id: gridpay_core::AlertId(Ulid::new()),
                    account_id: device.account_id,
                    device_id: Some(device.id),
                    kind: gridpay_core::AlertKind::DeviceOffline,
                    severity: gridpay_core::AlertSeverity::Warning,
                    message: format!("meter {} stopped reporting", device.serial).into_boxed_str(),
                    open: true,
                    opened_at: jiff::Timestamp::now(),
                    resolved_at: None,
                })
                .await
                .map_err(EngineError::storage)?;
            if opened {
                self.record_event(
                    EventLevel::Warn,
                    "device_offline",
                    format!("meter {} stopped reporting", device.serial),
                    Some(device.account_id),
                    Some(device.id),
                )
                .await?;
            }
        }

        Ok(stale.len())
    }
}

/// Account projection for the dashboard collaborator.
#[derive(Debug, Clone)]
pub struct AccountOverview {
    pub account_id: AccountId,
    pub name: String,
    pub status: AccountStatus,
    pub allocated_kwh: Kwh,
    pub used_kwh: Kwh,
    pub remaining_kwh: Kwh,
    pub today_kwh: Kwh,
    pub device_count: usize,
    pub open_alerts: usize,
}

/// Device projection for the dashboard collaborator.
#[derive(Debug, Clone)]
pub struct DeviceOverview {
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub serial: String,
    pub address: String,
    pub connectivity: Connectivity,
    pub last_seen: Option<jiff::Timestamp>,
    pub breaker_enabled: bool,
    pub last_breaker_state: Option<bool>,
    pub latest_reading: Option<LatestSample>,
}

#[derive(Debug, Clone)]
pub struct LatestSample {
    pub timestamp: jiff::Timestamp,
    pub energy_kwh: Kwh,
    pub delta_kwh: Kwh,
    pub power_kw: Option<ordered_float::NotNan<f64>>,
}

impl DeviceOverview {
    fn from_parts(device: Device, latest: Option<MeterReading>) -> Self {
        Self {
            device_id: device.id,
            account_id: device.account_id,
            serial: device.serial.to_string(),
            address: device.address.to_string(),
            connectivity: device.connectivity,
            last_seen: device.last_seen,
            breaker_enabled: device.breaker_enabled,
            last_breaker_state: device.last_breaker_state,
            latest_reading: latest.map(|r| LatestSample {
                timestamp: r.timestamp,
                energy_kwh: r.energy_kwh,
                delta_kwh: r.delta_kwh,
                power_kw: r.power_kw,
            }),
        }
    }
}

/// Midnight UTC of the current day, used for the "today" consumption
/// projection.
fn start_of_today() -> jiff::Timestamp {
    let now = jiff::Timestamp::now();
    match now.to_zoned(jiff::tz::TimeZone::UTC).start_of_day() {
        Ok(midnight) => midnight.timestamp(),
        Err(_) => now,
    }
}
