use gridpay_core::{
    Actor, BreakerCommand, BreakerStatus, CommandId, CommandResult, DeviceId, DeviceState,
    EventLevel, SwitchCommand, TerminalResult,
};
use tracing::{info, warn};
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::store::{AlertStore, CommandStore, CompletionOutcome, LedgerStore, MeterStore};

/// Hand-off payload returned to the caller of an enqueue: everything the
/// external worker needs to perform the physical write.
#[derive(Debug, Clone)]
pub struct EnqueuedCommand {
    pub command_id: CommandId,
    pub device_address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub target_state: bool,
}

/// One pending command as exposed to the polling worker.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub device_address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub command: SwitchCommand,
    pub target_state: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub requested_at: jiff::Timestamp,
}

/// Acknowledgement of a result report.
#[derive(Debug, Clone, Copy)]
pub struct ResultAck {
    /// False when the command was already terminal and the report had no
    /// effect beyond refreshed bookkeeping.
    pub applied: bool,
}

impl<M, L, A, C> Engine<M, L, A, C>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    /// Enqueue a breaker command. Validates the device and resolves the
    /// logical command into a target boolean state against the last
    /// committed coil status. This is the single hand-off point to the
    /// device-driver collaborator.
    pub async fn enqueue_command(
        &self,
        device_id: DeviceId,
        coil: u16,
        command: SwitchCommand,
        requested_by: Actor,
        max_retries: u32,
        notes: Option<String>,
    ) -> Result<EnqueuedCommand, EngineError> {
        let device = self
            .meters
            .device(device_id)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::DeviceNotFound(device_id))?;
        if device.state == DeviceState::Disabled {
            return Err(EngineError::DeviceDisabled(device_id));
        }

        let current = self
            .commands
            .breaker_status(device_id, coil)
            .await
            .map_err(EngineError::storage)?
            .map(|s| s.state);
        let target_state = command.target_state(current);

        let record = BreakerCommand {
            id: CommandId(Ulid::new()),
            device_id,
            coil,
            command,
            target_state,
            requested_by,
            notes: notes.map(String::into_boxed_str),
            retry_count: 0,
            max_retries,
            result: CommandResult::Pending,
            error: None,
            requested_at: jiff::Timestamp::now(),
            executed_at: None,
        };
        let command_id = record.id;

        self.commands
            .insert_command(record)
            .await
            .map_err(EngineError::storage)?;

        info!(
            command_id = ?command_id,
            device_id = ?device_id,
            coil,
            ?command,
            target_state,
            requested_by = ?requested_by,
            "breaker command enqueued"
        );

        Ok(EnqueuedCommand {
            command_id,
            device_address: device.address.to_string(),
            unit_id: device.unit_id,
            coil,
            target_state,
        })
    }

    /// Pending commands joined with the connection details the worker
    /// needs. Commands stay visible here until a result is recorded;
    /// claim semantics are the worker's responsibility.
    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>, EngineError> {
        let pending = self
            .commands
            .pending_commands()
            .await
            .map_err(EngineError::storage)?;

        let mut out = Vec::with_capacity(pending.len());
        for command in pending {
            let Some(device) = self
                .meters
                .device(command.device_id)
                .await
                .map_err(EngineError::storage)?
            else {
                warn!(command_id = ?command.id, device_id = ?command.device_id, "pending command for unknown device");
                continue;
            };
            out.push(PendingCommand {
                command_id: command.id,
                device_id: command.device_id,
                device_address: device.address.to_string(),
                unit_id: device.unit_id,
                coil: command.coil,
                command: command.command,
                target_state: command.target_state,
                retry_count: command.retry_count,
                max_retries: command.max_retries,
                requested_at: command.requested_at,
            });
        }
        Ok(out)
    }

    /// Count one execution attempt against the command's retry budget.
    /// The limit is soft: exceeding attempts are not counted but the
    /// command stays executable until a result arrives.
    pub async fn note_attempt(&self, command_id: CommandId) -> Result<bool, EngineError> {
        if self
            .commands
            .command(command_id)
            .await
            .map_err(EngineError::storage)?
            .is_none()
        {
            return Err(EngineError::CommandNotFound(command_id));
        }
        self.commands
            .record_attempt(command_id)
            .await
            .map_err(EngineError::storage)
    }

    /// Record the worker's terminal result for a command.
    ///
    /// The first report wins: on success the committed (device, coil)
    /// status is upserted and mirrored onto the device row. A duplicate
    /// report is acknowledged without further side effects.
    pub async fn record_result(
        &self,
        command_id: CommandId,
        result: TerminalResult,
        error: Option<String>,
    ) -> Result<ResultAck, EngineError> {
        let command = self
            .commands
            .command(command_id)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::CommandNotFound(command_id))?;

        let now = jiff::Timestamp::now();
        let outcome = self
            .commands
            .complete(command_id, result, error.clone(), now)
            .await
            .map_err(EngineError::storage)?
            .ok_or(EngineError::CommandNotFound(command_id))?;

        if outcome == CompletionOutcome::AlreadyTerminal {
            info!(command_id = ?command_id, ?result, "late result for terminal command ignored");
            return Ok(ResultAck { applied: false });
        }

        if result == TerminalResult::Success {
            self.commands
                .upsert_breaker_status(BreakerStatus {
                    device_id: command.device_id,
                    coil: command.coil,
                    state: command.target_state,
                    updated_at: now,
                    updated_by: command.requested_by,
                })
                .await
                .map_err(EngineError::storage)?;
            self.meters
                .set_breaker_state(command.device_id, command.target_state)
                .await
                .map_err(EngineError::storage)?;
        }

        let (level, message) = match result {
            TerminalResult::Success => (
                EventLevel::Info,
                format!(
                    "breaker coil {} set {}",
                    command.coil,
                    if command.target_state { "on" } else { "off" }
                ),
            ),
            TerminalResult::Failed => (
                EventLevel::Error,
                format!(
                    "breaker command failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                ),
            ),
            TerminalResult::Timeout => (
                EventLevel::Error,
                format!(
                    "breaker command timed out: {}",
                    error.as_deref().unwrap_or("no response")
                ),
            ),
        };
        self.record_event(level, "breaker_result", message, None, Some(command.device_id))
            .await?;

        Ok(ResultAck { applied: true })
    }
}

#[cfg(test)]
mod tests {
    use gridpay_core::AccountId;

    use super::super::testutil::{account, device, memory_engine, MemoryEngine};
    use super::*;
    use crate::store::{CommandStore as _, LedgerStore as _, MeterStore as _};

    async fn seeded() -> (MemoryEngine, DeviceId) {
        let engine = memory_engine();
        let acct = account(100.0, 0.0);
        let dev = device(acct.id);
        let device_id = dev.id;
        engine.ledger.add_account(acct).await.unwrap();
        engine.meters.add_device(dev).await.unwrap();
        (engine, device_id)
    }

    #[tokio::test]
    async fn enqueue_validates_the_device() {
        let (engine, device_id) = seeded().await;

        assert!(matches!(
            engine
                .enqueue_command(
                    DeviceId(Ulid::new()),
                    5,
                    SwitchCommand::Off,
                    Actor::System,
                    3,
                    None
                )
                .await,
            Err(EngineError::DeviceNotFound(_))
        ));

        let mut disabled = engine.meters.device(device_id).await.unwrap().unwrap();
        disabled.state = DeviceState::Disabled;
        engine.meters.update_device(device_id, disabled).await.unwrap();

        assert!(matches!(
            engine
                .enqueue_command(device_id, 5, SwitchCommand::Off, Actor::System, 3, None)
                .await,
            Err(EngineError::DeviceDisabled(_))
        ));
        assert!(engine.commands.pending_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_returns_the_hand_off_payload() {
        let (engine, device_id) = seeded().await;

        let enqueued = engine
            .enqueue_command(device_id, 5, SwitchCommand::On, Actor::System, 3, None)
            .await
            .unwrap();
        assert_eq!(enqueued.device_address, "10.0.0.17");
        assert_eq!(enqueued.unit_id, 1);
        assert!(enqueued.target_state);

        let pending = engine.pending_commands().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, enqueued.command_id);
        assert_eq!(pending[0].device_address, "10.0.0.17");
    }

    #[tokio::test]
    async fn toggle_flips_the_committed_status() {
        let (engine, device_id) = seeded().await;

        // No committed status yet: toggle closes the relay.
        let first = engine
            .enqueue_command(device_id, 5, SwitchCommand::Toggle, Actor::System, 3, None)
            .await
            .unwrap();
        assert!(first.target_state);

        engine
            .record_result(first.command_id, TerminalResult::Success, None)
            .await
            .unwrap();

        let second = engine
            .enqueue_command(device_id, 5, SwitchCommand::Toggle, Actor::System, 3, None)
            .await
            .unwrap();
        assert!(!second.target_state);
    }

    #[tokio::test]
    async fn success_commits_status_and_mirrors_device() {
        let (engine, device_id) = seeded().await;

        let enqueued = engine
            .enqueue_command(
                device_id,
                5,
                SwitchCommand::Off,
                Actor::Admin(AccountId(Ulid::new())),
                3,
                None,
            )
            .await
            .unwrap();

        let ack = engine
            .record_result(enqueued.command_id, TerminalResult::Success, None)
            .await
            .unwrap();
        assert!(ack.applied);

        let status = engine.commands.breaker_status(device_id, 5).await.unwrap().unwrap();
        assert!(!status.state);
        assert!(matches!(status.updated_by, Actor::Admin(_)));

        let device = engine.meters.device(device_id).await.unwrap().unwrap();
        assert_eq!(device.last_breaker_state, Some(false));
    }

    #[tokio::test]
    async fn failure_leaves_committed_status_untouched() {
        let (engine, device_id) = seeded().await;

        let enqueued = engine
            .enqueue_command(device_id, 5, SwitchCommand::Off, Actor::System, 3, None)
            .await
            .unwrap();
        engine
            .record_result(
                enqueued.command_id,
                TerminalResult::Failed,
                Some("connect_failed:10.0.0.17".to_string()),
            )
            .await
            .unwrap();

        assert!(engine.commands.breaker_status(device_id, 5).await.unwrap().is_none());
        let command = engine.commands.command(enqueued.command_id).await.unwrap().unwrap();
        assert_eq!(command.result, CommandResult::Failed);
        assert_eq!(command.error.as_deref(), Some("connect_failed:10.0.0.17"));
    }

    #[tokio::test]
    async fn late_conflicting_result_does_not_rewrite_history() {
        let (engine, device_id) = seeded().await;

        let enqueued = engine
            .enqueue_command(device_id, 5, SwitchCommand::On, Actor::System, 3, None)
            .await
            .unwrap();

        let first = engine
            .record_result(enqueued.command_id, TerminalResult::Success, None)
            .await
            .unwrap();
        assert!(first.applied);

        let late = engine
            .record_result(
                enqueued.command_id,
                TerminalResult::Failed,
                Some("late worker".to_string()),
            )
            .await
            .unwrap();
        assert!(!late.applied);

        // The committed status and stored result keep the first report.
        let status = engine.commands.breaker_status(device_id, 5).await.unwrap().unwrap();
        assert!(status.state);
        let command = engine.commands.command(enqueued.command_id).await.unwrap().unwrap();
        assert_eq!(command.result, CommandResult::Success);
    }

    #[tokio::test]
    async fn unknown_command_result_is_a_typed_error() {
        let (engine, _) = seeded().await;

        assert!(matches!(
            engine
                .record_result(CommandId(Ulid::new()), TerminalResult::Success, None)
                .await,
            Err(EngineError::CommandNotFound(_))
        ));
    }

    #[tokio::test]
    async fn attempts_count_until_the_soft_limit() {
        let (engine, device_id) = seeded().await;

        let enqueued = engine
            .enqueue_command(device_id, 5, SwitchCommand::Off, Actor::System, 2, None)
            .await
            .unwrap();

        assert!(engine.note_attempt(enqueued.command_id).await.unwrap());
        assert!(engine.note_attempt(enqueued.command_id).await.unwrap());
        assert!(!engine.note_attempt(enqueued.command_id).await.unwrap());
    }
}
