use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gridpay_core::{Account, AccountId, BillingTransaction, Kwh, ReadingId, Tariff};

use super::MemoryStoreError;
use crate::store::LedgerStore;

/// In-memory accounts, tariffs and billing transactions.
///
/// Balance mutations take the account map mutex for the whole
/// read-modify-write, which gives the same row-level serialization the
/// SQLite backend gets from single UPDATE statements.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    accounts: Arc<Mutex<HashMap<AccountId, Account>>>,
    tariffs: Arc<Mutex<Vec<Tariff>>>,
    transactions: Arc<Mutex<HashMap<ReadingId, BillingTransaction>>>,
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Error = MemoryStoreError;

    async fn add_account(&self, account: Account) -> Result<(), Self::Error> {
        let mut accounts = self.accounts.lock()?;
        accounts.insert(account.id, account);
        Ok(())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, Self::Error> {
        let accounts = self.accounts.lock()?;
        Ok(accounts.get(&id).cloned())
    }

    async fn add_used(&self, id: AccountId, delta: Kwh) -> Result<Option<Account>, Self::Error> {
        let mut accounts = self.accounts.lock()?;
        Ok(accounts.get_mut(&id).map(|account| {
            account.used_kwh += delta;
            account.clone()
        }))
    }

    async fn add_allocated(
        &self,
        id: AccountId,
        amount: Kwh,
    ) -> Result<Option<Account>, Self::Error> {
        let mut accounts = self.accounts.lock()?;
        Ok(accounts.get_mut(&id).map(|account| {
            account.allocated_kwh += amount;
            account.locked = false;
            account.clone()
        }))
    }

    async fn set_locked(&self, id: AccountId, locked: bool) -> Result<(), Self::Error> {
        let mut accounts = self.accounts.lock()?;
        if let Some(account) = accounts.get_mut(&id) {
            account.locked = locked;
        }
        Ok(())
    }

    async fn add_tariff(&self, tariff: Tariff) -> Result<(), Self::Error> {
        let mut tariffs = self.tariffs.lock()?;
        tariffs.push(tariff);
        Ok(())
    }

    async fn tariff_at(&self, at: jiff::Timestamp) -> Result<Option<Tariff>, Self::Error> {
        let tariffs = self.tariffs.lock()?;

        let in_window = tariffs
            .iter()
            .filter(|t| t.active && t.covers(at))
            .max_by_key(|t| t.effective_from);
        if let Some(tariff) = in_window {
            return Ok(Some(tariff.clone()));
        }

        // No window contains the timestamp: fall back to the most recently
        // effective active tariff.
        Ok(tariffs
            .iter()
            .filter(|t| t.active)
            .max_by_key(|t| t.effective_from)
            .cloned())
    }

    async fn insert_transaction(&self, tx: BillingTransaction) -> Result<bool, Self::Error> {
        let mut transactions = self.transactions.lock()?;
        if transactions.contains_key(&tx.reading_id) {
            return Ok(false);
        }
        transactions.insert(tx.reading_id, tx);
        Ok(true)
    }

    async fn transaction_for_reading(
        &self,
        reading_id: ReadingId,
    ) -> Result<Option<BillingTransaction>, Self::Error> {
        let transactions = self.transactions.lock()?;
        Ok(transactions.get(&reading_id).cloned())
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<BillingTransaction>, Self::Error> {
        let transactions = self.transactions.lock()?;
        let mut matching: Vec<BillingTransaction> = transactions
            .values()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect();
        matching.sort_by_key(|tx| tx.recorded_at);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use gridpay_core::{DeviceId, TariffId, TransactionId};
    use ordered_float::NotNan;
    use ulid::Ulid;

    use super::*;

    fn kwh(v: f64) -> Kwh {
        NotNan::new(v).unwrap()
    }

    fn tariff(name: &str, from: &str, to: Option<&str>) -> Tariff {
        Tariff {
            id: TariffId(Ulid::new()),
            name: name.into(),
            grid_rate: kwh(0.5),
            generator_rate: kwh(0.9),
            active: true,
            effective_from: from.parse().unwrap(),
            effective_to: to.map(|t| t.parse().unwrap()),
        }
    }

    fn transaction(reading_id: ReadingId) -> BillingTransaction {
        BillingTransaction {
            id: TransactionId(Ulid::new()),
            reading_id,
            account_id: AccountId(Ulid::new()),
            device_id: DeviceId(Ulid::new()),
            tariff_id: TariffId(Ulid::new()),
            delta_kwh: kwh(1.0),
            cost: kwh(0.5),
            recorded_at: jiff::Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn transaction_insert_is_conditional_on_reading() {
        let store = MemoryLedgerStore::default();
        let reading_id = ReadingId(Ulid::new());

        assert!(store.insert_transaction(transaction(reading_id)).await.unwrap());
        assert!(!store.insert_transaction(transaction(reading_id)).await.unwrap());
    }

    #[tokio::test]
    async fn tariff_selection_prefers_containing_window() {
        let store = MemoryLedgerStore::default();
        store
            .add_tariff(tariff("a", "2025-01-01T00:00:00Z", Some("2025-01-10T00:00:00Z")))
            .await
            .unwrap();
        store
            .add_tariff(tariff("b", "2025-01-10T00:00:00Z", None))
            .await
            .unwrap();

        let day5 = store
            .tariff_at("2025-01-05T00:00:00Z".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*day5.name, "a");

        let day15 = store
            .tariff_at("2025-01-15T00:00:00Z".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*day15.name, "b");
    }

    #[tokio::test]
    async fn tariff_selection_falls_back_outside_all_windows() {
        let store = MemoryLedgerStore::default();
        store
            .add_tariff(tariff("a", "2025-01-01T00:00:00Z", Some("2025-01-10T00:00:00Z")))
            .await
            .unwrap();

        // Before any window opened: the most recently effective active
        // tariff still applies.
        let early = store
            .tariff_at("2024-06-01T00:00:00Z".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*early.name, "a");
    }

    #[tokio::test]
    async fn recharge_mutation_clears_lock() {
        let store = MemoryLedgerStore::default();
        let id = AccountId(Ulid::new());
        store
            .add_account(Account {
                id,
                name: "acct".into(),
                allocated_kwh: kwh(10.0),
                used_kwh: kwh(10.0),
                active: true,
                locked: true,
                provisioned_at: jiff::Timestamp::now(),
            })
            .await
            .unwrap();

        let updated = store.add_allocated(id, kwh(50.0)).await.unwrap().unwrap();
        assert_eq!(updated.allocated_kwh, kwh(60.0));
        assert!(!updated.locked);
    }
}
