mod alert;
mod command;
mod ledger;
mod meter;

pub use alert::MemoryAlertStore;
pub use command::MemoryCommandStore;
pub use ledger::MemoryLedgerStore;
pub use meter::MemoryMeterStore;

use std::sync::PoisonError;

/// Error type shared by the in-memory stores.
///
/// The in-memory backend is primarily intended for testing and as a
/// reference implementation of the store traits.
#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),
}

impl<T> From<PoisonError<T>> for MemoryStoreError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStoreError::MutexPoisoned(err.to_string())
    }
}
