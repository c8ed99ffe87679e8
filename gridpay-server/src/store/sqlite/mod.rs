mod alert;
mod command;
mod ledger;
mod meter;

pub use alert::{SqliteAlertError, SqliteAlertStore};
pub use command::{SqliteCommandError, SqliteCommandStore};
pub use ledger::{SqliteLedgerError, SqliteLedgerStore};
pub use meter::{SqliteMeterError, SqliteMeterStore};

use sqlx::{SqlitePool, migrate::Migrator, sqlite::SqlitePoolOptions};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteOpenError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Open (or create) the database at `path` and bring the schema up to
/// date. The returned pool is shared by all four stores.
pub async fn open_pool(path: impl AsRef<str>) -> Result<SqlitePool, SqliteOpenError> {
    let connection_string = format!("sqlite:{}?mode=rwc", path.as_ref());
    let pool = SqlitePoolOptions::new().connect(&connection_string).await?;

    MIGRATOR.run(&pool).await?;

    Ok(pool)
}

/// In-memory database for tests. Capped at one connection: every SQLite
/// `:memory:` connection is its own database.
pub async fn open_pool_in_memory() -> Result<SqlitePool, SqliteOpenError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    MIGRATOR.run(&pool).await?;

    Ok(pool)
}
