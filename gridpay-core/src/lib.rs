use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` for strings that don't need to grow after creation.
// This keeps the domain structs compact and avoids accidental cloning of
// large values.
type BoxStr = Box<str>;

/// Energy in kilowatt-hours. NaN is rejected at the boundary.
pub type Kwh = NotNan<f64>;

/// Monetary amount in the platform's billing currency.
pub type Money = NotNan<f64>;

/// Fraction of the allocation below which an account is considered
/// low-balance.
pub const LOW_BALANCE_RATIO: f64 = 0.20;

/// Unique identifier for a metering device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Ulid);

/// Unique identifier for an ingested meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadingId(pub Ulid);

/// Unique identifier for a prepaid account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Ulid);

/// Unique identifier for a tariff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TariffId(pub Ulid);

/// Unique identifier for a billing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Ulid);

/// Unique identifier for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(pub Ulid);

/// Unique identifier for a breaker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Ulid);

/// Unique identifier for an operational event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

/// A registered metering device (power analyzer) in the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity of this device.
    pub id: DeviceId,
    /// Prepaid account that owns this device.
    pub account_id: AccountId,
    /// Serial number, used as the display name.
    pub serial: BoxStr,
    /// Network address (host or IP) of the meter.
    pub address: BoxStr,
    /// Protocol station/unit id on that address.
    pub unit_id: u8,
    /// Operational state of the device.
    pub state: DeviceState,
    /// Coil address of the disconnect relay, if one is wired.
    pub breaker_coil: Option<u16>,
    /// Whether breaker control is enabled for this device.
    pub breaker_enabled: bool,
    /// Whether balance exhaustion may disconnect this device.
    pub auto_disconnect: bool,
    /// Last breaker state committed by a successful command.
    pub last_breaker_state: Option<bool>,
    /// Connectivity derived from reading ingestion.
    pub connectivity: Connectivity,
    /// Timestamp of the last accepted reading.
    pub last_seen: Option<jiff::Timestamp>,
    /// Provisioning timestamp.
    pub provisioned_at: jiff::Timestamp,
}

/// Device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device may ingest readings and accept breaker commands.
    Active,
    /// Device is decommissioned or administratively blocked.
    Disabled,
}

/// Connectivity of a device as observed from its reading stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// No reading has ever been accepted.
    Unknown,
    Online,
    Offline,
    Error,
}

/// One ingested sample for a device at a timestamp.
///
/// Created only at ingestion time; never updated afterwards. The delta is
/// computed once against the previous reading and is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterReading {
    pub id: ReadingId,
    pub device_id: DeviceId,
    pub timestamp: jiff::Timestamp,
    /// Cumulative total energy counter.
    pub energy_kwh: Kwh,
    /// Cumulative grid-import counter, when the meter splits sources.
    pub grid_kwh: Option<Kwh>,
    /// Cumulative generator counter, when the meter splits sources.
    pub generator_kwh: Option<Kwh>,
    /// Instantaneous electrical snapshot. Informational only.
    pub power_kw: Option<NotNan<f64>>,
    pub voltage: Option<NotNan<f64>>,
    pub current: Option<NotNan<f64>>,
    pub frequency: Option<NotNan<f64>>,
    pub power_factor: Option<NotNan<f64>>,
    /// Energy consumed since the previous reading.
    pub delta_kwh: Kwh,
    pub quality: ReadingQuality,
}

/// Quality flag reported by the acquisition system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingQuality {
    Good,
    Suspect,
    Bad,
}

/// A prepaid account holding an energy allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: BoxStr,
    /// Total energy purchased so far.
    pub allocated_kwh: Kwh,
    /// Total energy consumed so far.
    pub used_kwh: Kwh,
    pub active: bool,
    /// Set when the balance is exhausted; cleared by recharge.
    pub locked: bool,
    pub provisioned_at: jiff::Timestamp,
}

impl Account {
    /// Remaining balance. Never clamped: over-consumption while a
    /// disconnect is in flight shows up as a negative remainder.
    pub fn remaining_kwh(&self) -> Kwh {
        self.allocated_kwh - self.used_kwh
    }

    /// Derived status, evaluated in priority order.
    ///
    /// An account that never had an allocation is `Active`, not
    /// `Exhausted`: exhaustion only applies once energy has been
    /// allocated or consumed.
    pub fn status(&self) -> AccountStatus {
        if !self.active {
            return AccountStatus::Inactive;
        }
        if self.locked {
            return AccountStatus::Locked;
        }
        let allocated = self.allocated_kwh.into_inner();
        let used = self.used_kwh.into_inner();
        let remaining = allocated - used;
        if (allocated > 0.0 || used > 0.0) && remaining <= 0.0 {
            return AccountStatus::Exhausted;
        }
        if allocated > 0.0 && remaining <= allocated * LOW_BALANCE_RATIO {
            return AccountStatus::LowBalance;
        }
        AccountStatus::Active
    }
}

/// Account status derived from the balance and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Inactive,
    Locked,
    Exhausted,
    LowBalance,
    Active,
}

/// A priced rate schedule with a validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tariff {
    pub id: TariffId,
    pub name: BoxStr,
    /// Rate per kWh drawn from the grid.
    pub grid_rate: Money,
    /// Rate per kWh drawn from a generator.
    pub generator_rate: Money,
    pub active: bool,
    pub effective_from: jiff::Timestamp,
    /// Open-ended when `None`.
    pub effective_to: Option<jiff::Timestamp>,
}

impl Tariff {
    /// Whether this tariff's validity window contains `at`.
    pub fn covers(&self, at: jiff::Timestamp) -> bool {
        self.effective_from <= at && self.effective_to.is_none_or(|to| at < to)
    }
}

/// One billing record per reading that produced a positive delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingTransaction {
    pub id: TransactionId,
    /// The reading this transaction settles. Unique: re-applying the same
    /// reading is a no-op.
    pub reading_id: ReadingId,
    pub account_id: AccountId,
    pub device_id: DeviceId,
    pub tariff_id: TariffId,
    pub delta_kwh: Kwh,
    pub cost: Money,
    pub recorded_at: jiff::Timestamp,
}

/// A balance or connectivity condition raised against an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub account_id: AccountId,
    pub device_id: Option<DeviceId>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: BoxStr,
    /// At most one open alert per (account, kind) exists at any time.
    pub open: bool,
    pub opened_at: jiff::Timestamp,
    pub resolved_at: Option<jiff::Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    LowBalance,
    Exhausted,
    DeviceOffline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Who asked for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    /// The platform itself (auto-disconnect, sweeps).
    System,
    /// An administrator acting on behalf of an account.
    Admin(AccountId),
}

/// Logical switch command for a breaker coil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchCommand {
    On,
    Off,
    Toggle,
}

impl SwitchCommand {
    /// Resolve the target boolean state given the last committed coil
    /// state. `Toggle` on a coil with no history closes the relay.
    pub fn target_state(self, current: Option<bool>) -> bool {
        match self {
            SwitchCommand::On => true,
            SwitchCommand::Off => false,
            SwitchCommand::Toggle => !current.unwrap_or(false),
        }
    }
}

/// A request to drive a device's breaker coil to a target state.
///
/// Created `Pending` by an enqueue operation and transitions exactly once
/// to a terminal result when the worker reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerCommand {
    pub id: CommandId,
    pub device_id: DeviceId,
    pub coil: u16,
    pub command: SwitchCommand,
    /// Target boolean state resolved at enqueue time.
    pub target_state: bool,
    pub requested_by: Actor,
    pub notes: Option<BoxStr>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: CommandResult,
    pub error: Option<BoxStr>,
    pub requested_at: jiff::Timestamp,
    pub executed_at: Option<jiff::Timestamp>,
}

impl BreakerCommand {
    pub fn is_terminal(&self) -> bool {
        self.result != CommandResult::Pending
    }
}

/// Execution result of a breaker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Pending,
    Success,
    Failed,
    Timeout,
}

/// Terminal results the worker may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalResult {
    Success,
    Failed,
    Timeout,
}

impl From<TerminalResult> for CommandResult {
    fn from(value: TerminalResult) -> Self {
        match value {
            TerminalResult::Success => CommandResult::Success,
            TerminalResult::Failed => CommandResult::Failed,
            TerminalResult::Timeout => CommandResult::Timeout,
        }
    }
}

/// Last committed state of one (device, coil) pair.
///
/// Updated only as a side effect of a command reaching `Success`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub device_id: DeviceId,
    pub coil: u16,
    pub state: bool,
    pub updated_at: jiff::Timestamp,
    pub updated_by: Actor,
}

/// One entry in the append-only operational log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsEvent {
    pub id: EventId,
    pub account_id: Option<AccountId>,
    pub device_id: Option<DeviceId>,
    pub level: EventLevel,
    /// Short machine-readable code, e.g. `reading_rejected`.
    pub kind: BoxStr,
    pub message: BoxStr,
    pub timestamp: jiff::Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwh(v: f64) -> Kwh {
        NotNan::new(v).unwrap()
    }

    fn account(allocated: f64, used: f64) -> Account {
        Account {
            id: AccountId(Ulid::new()),
            name: "test".into(),
            allocated_kwh: kwh(allocated),
            used_kwh: kwh(used),
            active: true,
            locked: false,
            provisioned_at: jiff::Timestamp::now(),
        }
    }

    #[test]
    fn status_priority_order() {
        let mut a = account(100.0, 85.0);
        assert_eq!(a.status(), AccountStatus::LowBalance);

        a.used_kwh = kwh(100.0);
        assert_eq!(a.status(), AccountStatus::Exhausted);

        a.locked = true;
        assert_eq!(a.status(), AccountStatus::Locked);

        a.active = false;
        assert_eq!(a.status(), AccountStatus::Inactive);
    }

    #[test]
    fn status_fresh_account_is_active() {
        // A never-provisioned allocation is not an exhausted one.
        let a = account(0.0, 0.0);
        assert_eq!(a.status(), AccountStatus::Active);
    }

    #[test]
    fn status_zero_allocation_with_usage_is_exhausted() {
        let a = account(0.0, 5.0);
        assert_eq!(a.status(), AccountStatus::Exhausted);
    }

    #[test]
    fn status_healthy_balance_is_active() {
        let a = account(100.0, 50.0);
        assert_eq!(a.status(), AccountStatus::Active);
        assert_eq!(a.remaining_kwh(), kwh(50.0));
    }

    #[test]
    fn remaining_can_go_negative() {
        let a = account(100.0, 130.0);
        assert_eq!(a.remaining_kwh(), kwh(-30.0));
        assert_eq!(a.status(), AccountStatus::Exhausted);
    }

    #[test]
    fn tariff_window_containment() {
        let from: jiff::Timestamp = "2025-01-01T00:00:00Z".parse().unwrap();
        let to: jiff::Timestamp = "2025-02-01T00:00:00Z".parse().unwrap();
        let tariff = Tariff {
            id: TariffId(Ulid::new()),
            name: "standard".into(),
            grid_rate: kwh(0.5),
            generator_rate: kwh(0.9),
            active: true,
            effective_from: from,
            effective_to: Some(to),
        };

        assert!(tariff.covers("2025-01-15T12:00:00Z".parse().unwrap()));
        assert!(tariff.covers(from));
        assert!(!tariff.covers(to));
        assert!(!tariff.covers("2024-12-31T23:59:59Z".parse().unwrap()));
    }

    #[test]
    fn open_ended_tariff_covers_future() {
        let tariff = Tariff {
            id: TariffId(Ulid::new()),
            name: "open".into(),
            grid_rate: kwh(0.5),
            generator_rate: kwh(0.9),
            active: true,
            effective_from: "2025-01-01T00:00:00Z".parse().unwrap(),
            effective_to: None,
        };
        assert!(tariff.covers("2030-01-01T00:00:00Z".parse().unwrap()));
    }

    #[test]
    fn toggle_resolves_against_last_state() {
        assert!(SwitchCommand::On.target_state(Some(false)));
        assert!(!SwitchCommand::Off.target_state(Some(true)));
        assert!(SwitchCommand::Toggle.target_state(Some(false)));
        assert!(!SwitchCommand::Toggle.target_state(Some(true)));
        // No history: toggle closes the relay.
        assert!(SwitchCommand::Toggle.target_state(None));
    }
}
