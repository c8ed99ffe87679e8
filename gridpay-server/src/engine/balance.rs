use gridpay_core::{
    Account, AccountId, AccountStatus, Actor, Alert, AlertId, AlertKind, AlertSeverity, CommandId,
    DeviceId, DeviceState, EventLevel, Kwh, SwitchCommand,
};
use ordered_float::NotNan;
use tracing::{info, warn};
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

/// Default retry budget for auto-issued disconnect commands.
const AUTO_DISCONNECT_RETRIES: u32 = 3;

/// What the balance evaluation did.
#[derive(Debug, Clone, Default)]
pub struct BalanceOutcome {
    pub status: Option<AccountStatus>,
    /// Alert kind opened by this evaluation, if any.
    pub opened_alert: Option<AlertKind>,
    /// Disconnect commands enqueued by this evaluation.
    pub disconnect_commands: Vec<CommandId>,
}

/// Result of a recharge operation.
#[derive(Debug, Clone)]
pub struct Recharged {
    pub account_id: AccountId,
    pub allocated_kwh: Kwh,
    pub remaining_kwh: Kwh,
}

impl<M, L, A, C> Engine<M, L, A, C>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    /// Re-derive the account's balance status and apply its side effects.
    ///
    /// Called after every energy debit. The conditional alert insert is
    /// the transition detector: a condition that is already alerted is a
    /// no-op, so re-evaluating an exhausted account does not disconnect
    /// it twice.
    pub async fn evaluate_balance(
        &self,
        account: &Account,
        device_hint: Option<DeviceId>,
    ) -> Result<BalanceOutcome, EngineError> {
        let status = account.status();
        let mut outcome = BalanceOutcome {
            status: Some(status),
            ..BalanceOutcome::default()
        };

        match status {
            AccountStatus::Exhausted => {
                let opened = self
                    .alerts
                    .open_if_absent(Alert {
                        id: AlertId(Ulid::new()),
                        account_id: account.id,
                        device_id: device_hint,
                        kind: AlertKind::Exhausted,
                        severity: AlertSeverity::Critical,
                        message: format!(
                            "allocation exhausted: {:.2} of {:.2} kWh used",
                            account.used_kwh, account.allocated_kwh
                        )
                        .into_boxed_str(),
                        open: true,
                        opened_at: jiff::Timestamp::now(),
                        resolved_at: None,
                    })
                    .await
                    .map_err(EngineError::storage)?;

                // The lock write is idempotent; repeating it keeps a
                // partially applied earlier evaluation safe to re-run.
                self.ledger
                    .set_locked(account.id, true)
                    .await
                    .map_err(EngineError::storage)?;

                if opened {
                    warn!(account_id = ?account.id, "account exhausted, locking and disconnecting");
                    self.record_event(
                        EventLevel::Warn,
                        "account_exhausted",
                        format!(
                            "allocation exhausted: {:.2} of {:.2} kWh used",
                            account.used_kwh, account.allocated_kwh
                        ),
                        Some(account.id),
                        device_hint,
                    )
                    .await?;

                    outcome.opened_alert = Some(AlertKind::Exhausted);
                    outcome.disconnect_commands = self.auto_disconnect(account).await?;
                }
            }
            AccountStatus::LowBalance => {
                let opened = self
                    .alerts
                    .open_if_absent(Alert {
                        id: AlertId(Ulid::new()),
                        account_id: account.id,
                        device_id: device_hint,
                        kind: AlertKind::LowBalance,
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "balance low: {:.2} of {:.2} kWh remaining",
                            account.remaining_kwh(),
                            account.allocated_kwh
                        )
                        .into_boxed_str(),
                        open: true,
                        opened_at: jiff::Timestamp::now(),
                        resolved_at: None,
                    })
                    .await
                    .map_err(EngineError::storage)?;
                if opened {
                    info!(account_id = ?account.id, remaining = %account.remaining_kwh(), "low balance alert opened");
                    outcome.opened_alert = Some(AlertKind::LowBalance);
                }
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Emit one OFF command per controllable device of an exhausted
    /// account, attributed to the system actor.
    async fn auto_disconnect(&self, account: &Account) -> Result<Vec<CommandId>, EngineError> {
        let devices = self
            .meters
            .devices_for_account(account.id)
            .await
            .map_err(EngineError::storage)?;

        let mut issued = Vec::new();
        for device in devices {
            if device.state != DeviceState::Active
                || !device.breaker_enabled
                || !device.auto_disconnect
            {
                continue;
            }
            let Some(coil) = device.breaker_coil else {
                continue;
            };

            match self
                .enqueue_command(
                    device.id,
                    coil,
                    SwitchCommand::Off,
                    Actor::System,
                    AUTO_DISCONNECT_RETRIES,
                    Some("balance exhausted".to_string()),
                )
                .await
            {
                Ok(enqueued) => {
                    info!(
                        device_id = ?device.id,
                        command_id = ?enqueued.command_id,
                        coil,
                        "auto-disconnect command enqueued"
                    );
                    issued.push(enqueued.command_id);
                }
                Err(err) => {
                    warn!(device_id = ?device.id, error = %err, "auto-disconnect enqueue failed");
                }
            }
        }

        if issued.is_empty() {
            // Not an error: the account simply has nothing we can switch
            // off.
            info!(account_id = ?account.id, "no controllable device for auto-disconnect");
        }

        Ok(issued)
    }

    /// Add energy to an account's allocation. Clears the lock and
    /// resolves the open exhaustion alert; this is the only path that
    /// closes it.
    pub async fn recharge(
        &self,
        account_id: AccountId,
        add_kwh: f64,
        approver: Actor,
        reference: Option<String>,
    ) -> Result<Recharged, EngineError> {
        if !add_kwh.is_finite() || add_kwh <= 0.0 {
            return Err(EngineError::InvalidRecharge);
        }
        let amount = NotNan::new(add_kwh).map_err(|_| EngineError::InvalidRecharge)?;

        let updated = self
            .ledger
            .add_allocated(account_id, amount)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::AccountNotFound(account_id))?;

        let now = jiff::Timestamp::now();
        let resolved = self
            .alerts
            .resolve(account_id, AlertKind::Exhausted, now)
            .await
            .map_err(EngineError::storage)?;
        if resolved > 0 {
            info!(account_id = ?account_id, "exhaustion alert resolved by recharge");
        }

        // The low-balance condition only clears once the balance actually
        // recovered past the threshold.
        if updated.status() == AccountStatus::Active {
            self.alerts
                .resolve(account_id, AlertKind::LowBalance, now)
                .await
                .map_err(EngineError::storage)?;
        }

        info!(account_id = ?account_id, approver = ?approver, add_kwh, "allocation recharged");
        let message = match &reference {
            Some(reference) => format!("recharged {add_kwh:.2} kWh (ref {reference})"),
            None => format!("recharged {add_kwh:.2} kWh"),
        };
        self.record_event(EventLevel::Info, "recharge", message, Some(account_id), None)
            .await?;

        Ok(Recharged {
            account_id,
            allocated_kwh: updated.allocated_kwh,
            remaining_kwh: updated.remaining_kwh(),
        })
    }
}

#[cfg(test)]
mod tests {
    use gridpay_core::{CommandResult, ReadingQuality};

    use super::super::testutil::{account, device, flat_tariff, kwh, memory_engine, MemoryEngine};
    use super::*;
    use crate::engine::IngestReading;
    use crate::store::{AlertStore as _, CommandStore as _, LedgerStore as _, MeterStore as _};

    fn sample(device_id: DeviceId, ts: &str, total: f64) -> IngestReading {
        IngestReading {
            device_id,
            timestamp: ts.parse().unwrap(),
            energy_kwh: Some(total),
            grid_kwh: None,
            generator_kwh: None,
            power_kw: None,
            voltage: None,
            current: None,
            frequency: None,
            power_factor: None,
            quality: ReadingQuality::Good,
        }
    }

    async fn seeded(allocated: f64) -> (MemoryEngine, DeviceId, AccountId) {
        let engine = memory_engine();
        let acct = account(allocated, 0.0);
        let account_id = acct.id;
        let dev = device(account_id);
        let device_id = dev.id;
        engine.ledger.add_account(acct).await.unwrap();
        engine.ledger.add_tariff(flat_tariff(0.5, 0.9)).await.unwrap();
        engine.meters.add_device(dev).await.unwrap();
        (engine, device_id, account_id)
    }

    #[tokio::test]
    async fn low_balance_opens_one_warning_alert() {
        let (engine, device_id, account_id) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        // 8.5 of 10 kWh used: remaining 1.5 <= 2.0 threshold.
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 108.5)).await.unwrap();

        let alerts = engine.alerts.open_alerts(account_id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowBalance);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);

        // Another low-balance reading does not duplicate the alert.
        engine.ingest(sample(device_id, "2025-03-01T12:00:00Z", 108.8)).await.unwrap();
        assert_eq!(engine.alerts.open_alerts(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_locks_alerts_and_disconnects_coil() {
        let (engine, device_id, account_id) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 110.0)).await.unwrap();

        let account = engine.ledger.account(account_id).await.unwrap().unwrap();
        assert!(account.locked);
        assert_eq!(account.status(), AccountStatus::Locked);

        let alerts = engine.alerts.open_alerts(account_id).await.unwrap();
        assert!(
            alerts
                .iter()
                .any(|a| a.kind == AlertKind::Exhausted && a.severity == AlertSeverity::Critical)
        );

        // Exactly one OFF command on coil 5, attributed to the system.
        let pending = engine.commands.pending_commands().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].coil, 5);
        assert_eq!(pending[0].command, SwitchCommand::Off);
        assert!(!pending[0].target_state);
        assert_eq!(pending[0].requested_by, Actor::System);
        assert_eq!(pending[0].result, CommandResult::Pending);
    }

    #[tokio::test]
    async fn continued_consumption_does_not_disconnect_twice() {
        let (engine, device_id, _) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 110.0)).await.unwrap();
        // Disconnect is delayed; the meter keeps counting.
        engine.ingest(sample(device_id, "2025-03-01T12:00:00Z", 111.0)).await.unwrap();

        assert_eq!(engine.commands.pending_commands().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn devices_without_breaker_control_are_skipped() {
        let engine = memory_engine();
        let acct = account(10.0, 0.0);
        let account_id = acct.id;
        let mut dev = device(account_id);
        dev.breaker_enabled = false;
        let device_id = dev.id;
        engine.ledger.add_account(acct).await.unwrap();
        engine.ledger.add_tariff(flat_tariff(0.5, 0.9)).await.unwrap();
        engine.meters.add_device(dev).await.unwrap();

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 112.0)).await.unwrap();

        // Exhausted and locked, but nothing to switch off.
        let account = engine.ledger.account(account_id).await.unwrap().unwrap();
        assert!(account.locked);
        assert!(engine.commands.pending_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recharge_unlocks_and_resolves_exhaustion() {
        let (engine, device_id, account_id) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 110.0)).await.unwrap();

        let recharged = engine
            .recharge(account_id, 50.0, Actor::System, Some("POS-1234".to_string()))
            .await
            .unwrap();
        assert_eq!(recharged.remaining_kwh, kwh(50.0));

        let account = engine.ledger.account(account_id).await.unwrap().unwrap();
        assert!(!account.locked);
        assert_eq!(account.status(), AccountStatus::Active);

        let open = engine.alerts.open_alerts(account_id).await.unwrap();
        assert!(open.iter().all(|a| a.kind != AlertKind::Exhausted));
    }

    #[tokio::test]
    async fn small_recharge_keeps_low_balance_alert_open() {
        let (engine, device_id, account_id) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 108.5)).await.unwrap();
        assert_eq!(engine.alerts.open_alerts(account_id).await.unwrap().len(), 1);

        // 10.5 allocated, 8.5 used: remaining 2.0 <= 2.1 threshold.
        engine
            .recharge(account_id, 0.5, Actor::System, None)
            .await
            .unwrap();
        let open = engine.alerts.open_alerts(account_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, AlertKind::LowBalance);
    }

    #[tokio::test]
    async fn recharge_validates_amount_and_account() {
        let (engine, _, account_id) = seeded(10.0).await;

        assert!(matches!(
            engine.recharge(account_id, 0.0, Actor::System, None).await,
            Err(EngineError::InvalidRecharge)
        ));
        assert!(matches!(
            engine.recharge(account_id, -5.0, Actor::System, None).await,
            Err(EngineError::InvalidRecharge)
        ));
        assert!(matches!(
            engine
                .recharge(AccountId(Ulid::new()), 5.0, Actor::System, None)
                .await,
            Err(EngineError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn exhaustion_after_recharge_triggers_again() {
        let (engine, device_id, account_id) = seeded(10.0).await;

        engine.ingest(sample(device_id, "2025-03-01T10:00:00Z", 100.0)).await.unwrap();
        engine.ingest(sample(device_id, "2025-03-01T11:00:00Z", 110.0)).await.unwrap();
        assert_eq!(engine.commands.pending_commands().await.unwrap().len(), 1);

        engine.recharge(account_id, 5.0, Actor::System, None).await.unwrap();

        // Burn through the recharge as well.
        engine.ingest(sample(device_id, "2025-03-01T12:00:00Z", 116.0)).await.unwrap();

        let account = engine.ledger.account(account_id).await.unwrap().unwrap();
        assert!(account.locked);
        // A fresh disconnect command was issued for the new exhaustion.
        assert_eq!(engine.commands.pending_commands().await.unwrap().len(), 2);
    }
}
