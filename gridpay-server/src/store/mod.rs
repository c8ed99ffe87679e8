pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use gridpay_core::{
    Account, AccountId, Alert, AlertKind, BillingTransaction, BreakerCommand, BreakerStatus,
    CommandId, Device, DeviceId, Kwh, MeterReading, OpsEvent, ReadingId, Tariff, TerminalResult,
};

/// What happened when a terminal result was recorded for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The command transitioned from pending to the terminal result.
    Applied,
    /// The command was already terminal; only the execution timestamp and
    /// message were refreshed.
    AlreadyTerminal,
}

/// Devices and their reading stream.
///
/// `insert_reading` is conditional on (device, timestamp): a redelivered
/// sample must return `false` and leave the store unchanged.
#[async_trait]
pub trait MeterStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn add_device(&self, device: Device) -> Result<(), Self::Error>;
    async fn device(&self, id: DeviceId) -> Result<Option<Device>, Self::Error>;
    async fn update_device(&self, id: DeviceId, new: Device) -> Result<(), Self::Error>;
    async fn devices_for_account(&self, account_id: AccountId)
    -> Result<Vec<Device>, Self::Error>;
    async fn list_devices(&self) -> Result<Vec<Device>, Self::Error>;

    /// Insert a reading unless one already exists for the same device and
    /// timestamp. Returns whether the row was new.
    async fn insert_reading(&self, reading: MeterReading) -> Result<bool, Self::Error>;
    /// Most recent reading for a device by timestamp.
    async fn latest_reading(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<MeterReading>, Self::Error>;
    async fn readings_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Vec<MeterReading>, Self::Error>;
    /// Sum of deltas for readings at or after `since`.
    async fn consumption_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Kwh, Self::Error>;

    /// Record contact from the device: last-seen plus online connectivity.
    async fn mark_seen(&self, id: DeviceId, at: jiff::Timestamp) -> Result<(), Self::Error>;
    /// Flip online devices whose last contact predates `stale_before` to
    /// offline. Returns the devices that transitioned.
    async fn mark_offline(
        &self,
        stale_before: jiff::Timestamp,
    ) -> Result<Vec<Device>, Self::Error>;
    /// Mirror the committed breaker state onto the device row.
    async fn set_breaker_state(&self, id: DeviceId, state: bool) -> Result<(), Self::Error>;
}

/// Accounts, tariffs and billing transactions.
///
/// The balance mutations are single-row read-modify-write operations:
/// concurrent debits against the same account must serialize at the row,
/// not in the caller.
#[async_trait]
pub trait LedgerStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn add_account(&self, account: Account) -> Result<(), Self::Error>;
    async fn account(&self, id: AccountId) -> Result<Option<Account>, Self::Error>;
    /// Atomically add to used energy and return the updated row.
    async fn add_used(&self, id: AccountId, delta: Kwh) -> Result<Option<Account>, Self::Error>;
    /// Atomically add to the allocation, clearing the lock, and return the
    /// updated row. This is the recharge balance mutation.
    async fn add_allocated(
        &self,
        id: AccountId,
        amount: Kwh,
    ) -> Result<Option<Account>, Self::Error>;
    async fn set_locked(&self, id: AccountId, locked: bool) -> Result<(), Self::Error>;

    async fn add_tariff(&self, tariff: Tariff) -> Result<(), Self::Error>;
    /// The tariff applicable at `at`: the most recently effective active
    /// tariff whose window contains the timestamp, falling back to the
    /// most recently effective active tariff when none does.
    async fn tariff_at(&self, at: jiff::Timestamp) -> Result<Option<Tariff>, Self::Error>;

    /// Insert a transaction unless one already exists for the reading.
    /// Returns whether the row was new.
    async fn insert_transaction(&self, tx: BillingTransaction) -> Result<bool, Self::Error>;
    async fn transaction_for_reading(
        &self,
        reading_id: ReadingId,
    ) -> Result<Option<BillingTransaction>, Self::Error>;
    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<BillingTransaction>, Self::Error>;
}

/// Alerts and the operational event log.
#[async_trait]
pub trait AlertStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the alert unless one of the same kind is already open for the
    /// account. Returns whether the alert was created. Safe to race: at
    /// most one caller wins.
    async fn open_if_absent(&self, alert: Alert) -> Result<bool, Self::Error>;
    /// Resolve the open alert of this kind, if any. Returns the number of
    /// alerts closed.
    async fn resolve(
        &self,
        account_id: AccountId,
        kind: AlertKind,
        at: jiff::Timestamp,
    ) -> Result<usize, Self::Error>;
    async fn open_alerts(&self, account_id: AccountId) -> Result<Vec<Alert>, Self::Error>;

    async fn record_event(&self, event: OpsEvent) -> Result<(), Self::Error>;
    async fn recent_events(&self, limit: usize) -> Result<Vec<OpsEvent>, Self::Error>;
}

/// Breaker commands and committed coil statuses.
#[async_trait]
pub trait CommandStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn insert_command(&self, command: BreakerCommand) -> Result<(), Self::Error>;
    async fn command(&self, id: CommandId) -> Result<Option<BreakerCommand>, Self::Error>;
    /// Pending commands, oldest first.
    async fn pending_commands(&self) -> Result<Vec<BreakerCommand>, Self::Error>;
    async fn commands_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<BreakerCommand>, Self::Error>;

    /// Count one execution attempt. Increments only while the command is
    /// pending and below its retry limit; returns whether it counted.
    async fn record_attempt(&self, id: CommandId) -> Result<bool, Self::Error>;
    /// Record a terminal result. The pending-to-terminal transition is a
    /// compare-and-swap: a command that is already terminal keeps its
    /// result and only refreshes the execution timestamp and message.
    /// `None` when the command does not exist.
    async fn complete(
        &self,
        id: CommandId,
        result: TerminalResult,
        error: Option<String>,
        at: jiff::Timestamp,
    ) -> Result<Option<CompletionOutcome>, Self::Error>;

    async fn breaker_status(
        &self,
        device_id: DeviceId,
        coil: u16,
    ) -> Result<Option<BreakerStatus>, Self::Error>;
    /// Last-write-wins upsert keyed by (device, coil).
    async fn upsert_breaker_status(&self, status: BreakerStatus) -> Result<(), Self::Error>;
}
