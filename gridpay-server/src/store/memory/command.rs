use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gridpay_core::{
    BreakerCommand, BreakerStatus, CommandId, CommandResult, DeviceId, TerminalResult,
};

use super::MemoryStoreError;
use crate::store::{CommandStore, CompletionOutcome};

/// In-memory breaker commands and committed coil statuses.
#[derive(Clone, Default)]
pub struct MemoryCommandStore {
    commands: Arc<Mutex<HashMap<CommandId, BreakerCommand>>>,
    statuses: Arc<Mutex<HashMap<(DeviceId, u16), BreakerStatus>>>,
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    type Error = MemoryStoreError;

    async fn insert_command(&self, command: BreakerCommand) -> Result<(), Self::Error> {
        let mut commands = self.commands.lock()?;
        commands.insert(command.id, command);
        Ok(())
    }

    async fn command(&self, id: CommandId) -> Result<Option<BreakerCommand>, Self::Error> {
        let commands = self.commands.lock()?;
        Ok(commands.get(&id).cloned())
    }

    async fn pending_commands(&self) -> Result<Vec<BreakerCommand>, Self::Error> {
        let commands = self.commands.lock()?;
        let mut pending: Vec<BreakerCommand> = commands
            .values()
            .filter(|c| c.result == CommandResult::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.requested_at);
        Ok(pending)
    }

    async fn commands_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<BreakerCommand>, Self::Error> {
        let commands = self.commands.lock()?;
        let mut matching: Vec<BreakerCommand> = commands
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect();
        matching.sort_by_key(|c| c.requested_at);
        Ok(matching)
    }

    async fn record_attempt(&self, id: CommandId) -> Result<bool, Self::Error> {
        let mut commands = self.commands.lock()?;
        let Some(command) = commands.get_mut(&id) else {
            return Ok(false);
        };

        if command.result == CommandResult::Pending && command.retry_count < command.max_retries {
            command.retry_count += 1;
            return Ok(true);
        }

        Ok(false)
    }

    async fn complete(
        &self,
        id: CommandId,
        result: TerminalResult,
        error: Option<String>,
        at: jiff::Timestamp,
    ) -> Result<Option<CompletionOutcome>, Self::Error> {
        let mut commands = self.commands.lock()?;
        let Some(command) = commands.get_mut(&id) else {
            return Ok(None);
        };

        if command.result != CommandResult::Pending {
            // Already terminal: the stored result is immutable, only the
            // execution bookkeeping is refreshed.
            command.executed_at = Some(at);
            if let Some(message) = error {
                command.error = Some(message.into_boxed_str());
            }
            return Ok(Some(CompletionOutcome::AlreadyTerminal));
        }

        command.result = result.into();
        command.error = error.map(String::into_boxed_str);
        command.executed_at = Some(at);
        Ok(Some(CompletionOutcome::Applied))
    }

    async fn breaker_status(
        &self,
        device_id: DeviceId,
        coil: u16,
    ) -> Result<Option<BreakerStatus>, Self::Error> {
        let statuses = self.statuses.lock()?;
        Ok(statuses.get(&(device_id, coil)).cloned())
    }

    async fn upsert_breaker_status(&self, status: BreakerStatus) -> Result<(), Self::Error> {
        let mut statuses = self.statuses.lock()?;
        statuses.insert((status.device_id, status.coil), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gridpay_core::{Actor, SwitchCommand};
    use ulid::Ulid;

    use super::*;

    fn pending_command(max_retries: u32) -> BreakerCommand {
        BreakerCommand {
            id: CommandId(Ulid::new()),
            device_id: DeviceId(Ulid::new()),
            coil: 5,
            command: SwitchCommand::Off,
            target_state: false,
            requested_by: Actor::System,
            notes: None,
            retry_count: 0,
            max_retries,
            result: CommandResult::Pending,
            error: None,
            requested_at: jiff::Timestamp::now(),
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn complete_is_a_one_way_transition() {
        let store = MemoryCommandStore::default();
        let command = pending_command(3);
        let id = command.id;
        store.insert_command(command).await.unwrap();

        let now = jiff::Timestamp::now();
        let first = store
            .complete(id, TerminalResult::Success, None, now)
            .await
            .unwrap();
        assert_eq!(first, Some(CompletionOutcome::Applied));

        let second = store
            .complete(id, TerminalResult::Failed, Some("late".into()), now)
            .await
            .unwrap();
        assert_eq!(second, Some(CompletionOutcome::AlreadyTerminal));

        let stored = store.command(id).await.unwrap().unwrap();
        assert_eq!(stored.result, CommandResult::Success);
    }

    #[tokio::test]
    async fn attempts_stop_counting_at_the_retry_limit() {
        let store = MemoryCommandStore::default();
        let command = pending_command(2);
        let id = command.id;
        store.insert_command(command).await.unwrap();

        assert!(store.record_attempt(id).await.unwrap());
        assert!(store.record_attempt(id).await.unwrap());
        assert!(!store.record_attempt(id).await.unwrap());

        let stored = store.command(id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn attempts_stop_counting_once_terminal() {
        let store = MemoryCommandStore::default();
        let command = pending_command(5);
        let id = command.id;
        store.insert_command(command).await.unwrap();

        store
            .complete(id, TerminalResult::Failed, Some("no route".into()), jiff::Timestamp::now())
            .await
            .unwrap();
        assert!(!store.record_attempt(id).await.unwrap());
    }
}
