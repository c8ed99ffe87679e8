use serde::{Deserialize, Serialize};

use gridpay_core::{
    AccountStatus, Alert, AlertKind, AlertSeverity, Connectivity, ReadingQuality, SwitchCommand,
    TerminalResult,
};

use crate::engine::{
    AccountOverview, DeviceOverview, EnqueuedCommand, PendingCommand, Recharged,
};

// Common response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

// Reading ingestion
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub device_id: String,
    pub timestamp: jiff::Timestamp,
    pub energy_kwh: Option<f64>,
    pub grid_kwh: Option<f64>,
    pub generator_kwh: Option<f64>,
    pub power_kw: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub reading_id: Option<String>,
    pub delta_kwh: Option<f64>,
    pub reason: Option<String>,
}

pub fn parse_quality(raw: Option<&str>) -> ReadingQuality {
    match raw.map(str::to_ascii_uppercase).as_deref() {
        Some("SUSPECT") => ReadingQuality::Suspect,
        Some("BAD") => ReadingQuality::Bad,
        _ => ReadingQuality::Good,
    }
}

// Accounts
#[derive(Debug, Deserialize)]
pub struct AccountCreateRequest {
    pub name: String,
    #[serde(default)]
    pub allocated_kwh: f64,
}

#[derive(Debug, Serialize)]
pub struct AccountOverviewResponse {
    pub account_id: String,
    pub name: String,
    pub status: AccountStatus,
    pub allocated_kwh: f64,
    pub used_kwh: f64,
    pub remaining_kwh: f64,
    pub today_kwh: f64,
    pub device_count: usize,
    pub open_alerts: usize,
}

impl From<AccountOverview> for AccountOverviewResponse {
    fn from(overview: AccountOverview) -> Self {
        Self {
            account_id: overview.account_id.0.to_string(),
            name: overview.name,
            status: overview.status,
            allocated_kwh: overview.allocated_kwh.into_inner(),
            used_kwh: overview.used_kwh.into_inner(),
            remaining_kwh: overview.remaining_kwh.into_inner(),
            today_kwh: overview.today_kwh.into_inner(),
            device_count: overview.device_count,
            open_alerts: overview.open_alerts,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub amount_kwh: f64,
    pub approver_id: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RechargeResponse {
    pub account_id: String,
    pub allocated_kwh: f64,
    pub remaining_kwh: f64,
}

impl From<Recharged> for RechargeResponse {
    fn from(recharged: Recharged) -> Self {
        Self {
            account_id: recharged.account_id.0.to_string(),
            allocated_kwh: recharged.allocated_kwh.into_inner(),
            remaining_kwh: recharged.remaining_kwh.into_inner(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AlertResponse {
    pub id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub device_id: Option<String>,
    pub opened_at: String,
}

impl From<Alert> for AlertResponse {
    fn from(alert: Alert) -> Self {
        Self {
            id: alert.id.0.to_string(),
            kind: alert.kind,
            severity: alert.severity,
            message: alert.message.to_string(),
            device_id: alert.device_id.map(|d| d.0.to_string()),
            opened_at: alert.opened_at.to_string(),
        }
    }
}

// Devices
#[derive(Debug, Deserialize)]
pub struct DeviceCreateRequest {
    pub account_id: String,
    pub serial: String,
    pub address: String,
    #[serde(default)]
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub breaker_coil: Option<u16>,
    #[serde(default)]
    pub breaker_enabled: bool,
    #[serde(default)]
    pub auto_disconnect: bool,
}

#[derive(Debug, Serialize)]
pub struct DeviceOverviewResponse {
    pub device_id: String,
    pub account_id: String,
    pub serial: String,
    pub address: String,
    pub connectivity: Connectivity,
    pub last_seen: Option<String>,
    pub breaker_enabled: bool,
    pub last_breaker_state: Option<bool>,
    pub latest_reading: Option<LatestSampleResponse>,
}

#[derive(Debug, Serialize)]
pub struct LatestSampleResponse {
    pub timestamp: String,
    pub energy_kwh: f64,
    pub delta_kwh: f64,
    pub power_kw: Option<f64>,
}

impl From<DeviceOverview> for DeviceOverviewResponse {
    fn from(overview: DeviceOverview) -> Self {
        Self {
            device_id: overview.device_id.0.to_string(),
            account_id: overview.account_id.0.to_string(),
            serial: overview.serial,
            address: overview.address,
            connectivity: overview.connectivity,
            last_seen: overview.last_seen.map(|t| t.to_string()),
            breaker_enabled: overview.breaker_enabled,
            last_breaker_state: overview.last_breaker_state,
            latest_reading: overview.latest_reading.map(|r| LatestSampleResponse {
                timestamp: r.timestamp.to_string(),
                energy_kwh: r.energy_kwh.into_inner(),
                delta_kwh: r.delta_kwh.into_inner(),
                power_kw: r.power_kw.map(|p| p.into_inner()),
            }),
        }
    }
}

// Tariffs
#[derive(Debug, Deserialize)]
pub struct TariffCreateRequest {
    pub name: String,
    pub grid_rate: f64,
    pub generator_rate: f64,
    #[serde(default)]
    pub effective_from: Option<jiff::Timestamp>,
    #[serde(default)]
    pub effective_to: Option<jiff::Timestamp>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

// Breaker commands
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub coil_address: u16,
    /// ON, OFF or TOGGLE (case-insensitive).
    pub command: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub requester_id: Option<String>,
    pub notes: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

pub fn parse_switch_command(raw: &str) -> Option<SwitchCommand> {
    match raw.to_ascii_uppercase().as_str() {
        "ON" => Some(SwitchCommand::On),
        "OFF" => Some(SwitchCommand::Off),
        "TOGGLE" => Some(SwitchCommand::Toggle),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub device_address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub target_state: bool,
}

impl From<EnqueuedCommand> for CommandResponse {
    fn from(enqueued: EnqueuedCommand) -> Self {
        Self {
            command_id: enqueued.command_id.0.to_string(),
            device_address: enqueued.device_address,
            unit_id: enqueued.unit_id,
            coil: enqueued.coil,
            target_state: enqueued.target_state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingCommandResponse {
    pub command_id: String,
    pub device_id: String,
    pub device_address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub command: SwitchCommand,
    pub target_state: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub requested_at: String,
}

impl From<PendingCommand> for PendingCommandResponse {
    fn from(pending: PendingCommand) -> Self {
        Self {
            command_id: pending.command_id.0.to_string(),
            device_id: pending.device_id.0.to_string(),
            device_address: pending.device_address,
            unit_id: pending.unit_id,
            coil: pending.coil,
            command: pending.command,
            target_state: pending.target_state,
            retry_count: pending.retry_count,
            max_retries: pending.max_retries,
            requested_at: pending.requested_at.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    /// SUCCESS, FAILED or TIMEOUT (case-insensitive).
    pub result: String,
    pub error_message: Option<String>,
}

pub fn parse_terminal_result(raw: &str) -> Option<TerminalResult> {
    match raw.to_ascii_uppercase().as_str() {
        "SUCCESS" => Some(TerminalResult::Success),
        "FAILED" => Some(TerminalResult::Failed),
        "TIMEOUT" => Some(TerminalResult::Timeout),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct ResultAckResponse {
    pub command_id: String,
    pub applied: bool,
}
