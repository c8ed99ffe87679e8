use std::str::FromStr;

use async_trait::async_trait;
use gridpay_core::{
    AccountId, Actor, BreakerCommand, BreakerStatus, CommandId, CommandResult, DeviceId,
    SwitchCommand, TerminalResult,
};
use sqlx::{Row, SqlitePool};
use ulid::Ulid;

use crate::store::{CommandStore, CompletionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SqliteCommandError {
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
pub struct SqliteCommandStore {
    pool: SqlitePool,
}

impl SqliteCommandStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    type Error = SqliteCommandError;

    async fn insert_command(&self, command: BreakerCommand) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO breaker_commands
                (id, device_id, coil, command, target_state, requested_by, notes,
                 retry_count, max_retries, result, error, requested_at, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command.id.0.to_string())
        .bind(command.device_id.0.to_string())
        .bind(command.coil as i32)
        .bind(switch_to_text(command.command))
        .bind(command.target_state)
        .bind(actor_to_text(command.requested_by))
        .bind(command.notes.as_deref())
        .bind(command.retry_count as i32)
        .bind(command.max_retries as i32)
        .bind(result_to_text(command.result))
        .bind(command.error.as_deref())
        .bind(command.requested_at.as_millisecond())
        .bind(command.executed_at.map(|t| t.as_millisecond()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn command(&self, id: CommandId) -> Result<Option<BreakerCommand>, Self::Error> {
        let row = sqlx::query("SELECT * FROM breaker_commands WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_row_to_command(&r)).transpose()
    }

    async fn pending_commands(&self) -> Result<Vec<BreakerCommand>, Self::Error> {
        let rows = sqlx::query(
            "SELECT * FROM breaker_commands WHERE result = 'pending' ORDER BY requested_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_command).collect()
    }

    async fn commands_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<BreakerCommand>, Self::Error> {
        let rows = sqlx::query(
            "SELECT * FROM breaker_commands WHERE device_id = ? ORDER BY requested_at",
        )
        .bind(device_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_command).collect()
    }

    async fn record_attempt(&self, id: CommandId) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE breaker_commands SET retry_count = retry_count + 1
            WHERE id = ? AND result = 'pending' AND retry_count < max_retries
            "#,
        )
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: CommandId,
        result: TerminalResult,
        error: Option<String>,
        at: jiff::Timestamp,
    ) -> Result<Option<CompletionOutcome>, Self::Error> {
        // Compare-and-swap on the pending state: the first terminal report
        // wins, every later one only refreshes the bookkeeping columns.
        let applied = sqlx::query(
            r#"
            UPDATE breaker_commands SET result = ?, error = ?, executed_at = ?
            WHERE id = ? AND result = 'pending'
            "#,
        )
        .bind(result_to_text(CommandResult::from(result)))
        .bind(error.as_deref())
        .bind(at.as_millisecond())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if applied.rows_affected() == 1 {
            return Ok(Some(CompletionOutcome::Applied));
        }

        let refreshed = sqlx::query(
            "UPDATE breaker_commands SET executed_at = ?, error = COALESCE(?, error) WHERE id = ?",
        )
        .bind(at.as_millisecond())
        .bind(error.as_deref())
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if refreshed.rows_affected() == 1 {
            Ok(Some(CompletionOutcome::AlreadyTerminal))
        } else {
            Ok(None)
        }
    }

    async fn breaker_status(
        &self,
        device_id: DeviceId,
        coil: u16,
    ) -> Result<Option<BreakerStatus>, Self::Error> {
        let row = sqlx::query("SELECT * FROM breaker_statuses WHERE device_id = ? AND coil = ?")
            .bind(device_id.0.to_string())
            .bind(coil as i32)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_row_to_status(&r)).transpose()
    }

    async fn upsert_breaker_status(&self, status: BreakerStatus) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO breaker_statuses (device_id, coil, state, updated_at, updated_by)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (device_id, coil) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by
            "#,
        )
        .bind(status.device_id.0.to_string())
        .bind(status.coil as i32)
        .bind(status.state)
        .bind(status.updated_at.as_millisecond())
        .bind(actor_to_text(status.updated_by))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn switch_to_text(command: SwitchCommand) -> &'static str {
    match command {
        SwitchCommand::On => "on",
        SwitchCommand::Off => "off",
        SwitchCommand::Toggle => "toggle",
    }
}

fn result_to_text(result: CommandResult) -> &'static str {
    match result {
        CommandResult::Pending => "pending",
        CommandResult::Success => "success",
        CommandResult::Failed => "failed",
        CommandResult::Timeout => "timeout",
    }
}

fn actor_to_text(actor: Actor) -> String {
    match actor {
        Actor::System => "system".to_string(),
        Actor::Admin(account_id) => format!("admin:{}", account_id.0),
    }
}

fn parse_actor(raw: &str) -> Result<Actor, SqliteCommandError> {
    if raw == "system" {
        return Ok(Actor::System);
    }
    if let Some(id) = raw.strip_prefix("admin:") {
        let ulid =
            Ulid::from_str(id).map_err(|_| SqliteCommandError::InvalidUlid(id.to_string()))?;
        return Ok(Actor::Admin(AccountId(ulid)));
    }
    Err(SqliteCommandError::InvalidEnum(raw.to_string()))
}

fn parse_ulid(raw: String) -> Result<Ulid, SqliteCommandError> {
    Ulid::from_str(&raw).map_err(|_| SqliteCommandError::InvalidUlid(raw))
}

fn parse_timestamp(millis: i64) -> Result<jiff::Timestamp, SqliteCommandError> {
    jiff::Timestamp::from_millisecond(millis)
        .map_err(|_| SqliteCommandError::InvalidTimestamp(millis))
}

fn map_row_to_command(r: &sqlx::sqlite::SqliteRow) -> Result<BreakerCommand, SqliteCommandError> {
    let command = match r.try_get::<String, _>("command")?.as_str() {
        "on" => SwitchCommand::On,
        "off" => SwitchCommand::Off,
        "toggle" => SwitchCommand::Toggle,
        other => return Err(SqliteCommandError::InvalidEnum(other.to_string())),
    };
    let result = match r.try_get::<String, _>("result")?.as_str() {
        "pending" => CommandResult::Pending,
        "success" => CommandResult::Success,
        "failed" => CommandResult::Failed,
        "timeout" => CommandResult::Timeout,
        other => return Err(SqliteCommandError::InvalidEnum(other.to_string())),
    };

    Ok(BreakerCommand {
        id: CommandId(parse_ulid(r.try_get("id")?)?),
        device_id: DeviceId(parse_ulid(r.try_get("device_id")?)?),
        coil: r.try_get::<i32, _>("coil")? as u16,
        command,
        target_state: r.try_get("target_state")?,
        requested_by: parse_actor(&r.try_get::<String, _>("requested_by")?)?,
        notes: r
            .try_get::<Option<String>, _>("notes")?
            .map(String::into_boxed_str),
        retry_count: r.try_get::<i32, _>("retry_count")? as u32,
        max_retries: r.try_get::<i32, _>("max_retries")? as u32,
        result,
        error: r
            .try_get::<Option<String>, _>("error")?
            .map(String::into_boxed_str),
        requested_at: parse_timestamp(r.try_get("requested_at")?)?,
        executed_at: r
            .try_get::<Option<i64>, _>("executed_at")?
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn map_row_to_status(r: &sqlx::sqlite::SqliteRow) -> Result<BreakerStatus, SqliteCommandError> {
    Ok(BreakerStatus {
        device_id: DeviceId(parse_ulid(r.try_get("device_id")?)?),
        coil: r.try_get::<i32, _>("coil")? as u16,
        state: r.try_get("state")?,
        updated_at: parse_timestamp(r.try_get("updated_at")?)?,
        updated_by: parse_actor(&r.try_get::<String, _>("updated_by")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::open_pool_in_memory;

    fn pending_command() -> BreakerCommand {
        BreakerCommand {
            id: CommandId(Ulid::new()),
            device_id: DeviceId(Ulid::new()),
            coil: 5,
            command: SwitchCommand::Off,
            target_state: false,
            requested_by: Actor::System,
            notes: Some("balance exhausted".into()),
            retry_count: 0,
            max_retries: 3,
            result: CommandResult::Pending,
            error: None,
            requested_at: jiff::Timestamp::now(),
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn complete_transitions_exactly_once() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteCommandStore::new(pool);

        let command = pending_command();
        let id = command.id;
        store.insert_command(command).await.unwrap();

        let now = jiff::Timestamp::now();
        assert_eq!(
            store.complete(id, TerminalResult::Success, None, now).await.unwrap(),
            Some(CompletionOutcome::Applied)
        );
        assert_eq!(
            store
                .complete(id, TerminalResult::Failed, Some("late report".into()), now)
                .await
                .unwrap(),
            Some(CompletionOutcome::AlreadyTerminal)
        );

        let stored = store.command(id).await.unwrap().unwrap();
        assert_eq!(stored.result, CommandResult::Success);

        let unknown = store
            .complete(CommandId(Ulid::new()), TerminalResult::Success, None, now)
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn pending_listing_is_oldest_first_and_shrinks() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteCommandStore::new(pool);

        let mut first = pending_command();
        first.requested_at = "2025-03-01T10:00:00Z".parse().unwrap();
        let mut second = pending_command();
        second.requested_at = "2025-03-01T11:00:00Z".parse().unwrap();
        let first_id = first.id;

        store.insert_command(second).await.unwrap();
        store.insert_command(first).await.unwrap();

        let pending = store.pending_commands().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first_id);

        store
            .complete(first_id, TerminalResult::Success, None, jiff::Timestamp::now())
            .await
            .unwrap();
        assert_eq!(store.pending_commands().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_upsert_is_last_write_wins() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteCommandStore::new(pool);
        let device_id = DeviceId(Ulid::new());

        store
            .upsert_breaker_status(BreakerStatus {
                device_id,
                coil: 5,
                state: true,
                updated_at: jiff::Timestamp::now(),
                updated_by: Actor::System,
            })
            .await
            .unwrap();
        store
            .upsert_breaker_status(BreakerStatus {
                device_id,
                coil: 5,
                state: false,
                updated_at: jiff::Timestamp::now(),
                updated_by: Actor::Admin(AccountId(Ulid::new())),
            })
            .await
            .unwrap();

        let status = store.breaker_status(device_id, 5).await.unwrap().unwrap();
        assert!(!status.state);
        assert!(matches!(status.updated_by, Actor::Admin(_)));
    }

    #[tokio::test]
    async fn retry_counter_respects_the_soft_limit() {
        let pool = open_pool_in_memory().await.unwrap();
        let store = SqliteCommandStore::new(pool);

        let mut command = pending_command();
        command.max_retries = 2;
        let id = command.id;
        store.insert_command(command).await.unwrap();

        assert!(store.record_attempt(id).await.unwrap());
        assert!(store.record_attempt(id).await.unwrap());
        assert!(!store.record_attempt(id).await.unwrap());

        let stored = store.command(id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
    }
}
