use gridpay_core::{
    BillingTransaction, Device, EventLevel, Kwh, MeterReading, Money, Tariff, TransactionId,
};
use tracing::{info, warn};
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

impl<M, L, A, C> Engine<M, L, A, C>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    /// Convert one accepted reading with a positive delta into money and
    /// balance movement.
    ///
    /// The conditional transaction insert keyed by reading id is the
    /// single source of truth for "already processed": the energy debit
    /// only happens on the side that actually created the transaction, so
    /// a re-run from the top of the pipeline cannot double-charge money or
    /// double-debit energy.
    pub(crate) async fn apply_billing(
        &self,
        device: &Device,
        reading: &MeterReading,
        previous: Option<&MeterReading>,
    ) -> Result<(), EngineError> {
        let Some(account) = self
            .ledger
            .account(device.account_id)
            .await
            .map_err(EngineError::storage)?
        else {
            warn!(device_id = ?device.id, account_id = ?device.account_id, "device has no owning account, skipping billing");
            return Ok(());
        };

        if self
            .ledger
            .transaction_for_reading(reading.id)
            .await
            .map_err(EngineError::storage)?
            .is_some()
        {
            info!(reading_id = ?reading.id, "reading already billed");
            return Ok(());
        }

        let tariff = self
            .ledger
            .tariff_at(reading.timestamp)
            .await
            .map_err(EngineError::storage)?;

        let inserted = match tariff {
            Some(tariff) => {
                let cost = compute_cost(reading, previous, &tariff);
                let tx = BillingTransaction {
                    id: TransactionId(Ulid::new()),
                    reading_id: reading.id,
                    account_id: account.id,
                    device_id: device.id,
                    tariff_id: tariff.id,
                    delta_kwh: reading.delta_kwh,
                    cost,
                    recorded_at: jiff::Timestamp::now(),
                };
                let inserted = self
                    .ledger
                    .insert_transaction(tx)
                    .await
                    .map_err(EngineError::storage)?;
                if inserted {
                    self.record_event(
                        EventLevel::Info,
                        "billing_applied",
                        format!(
                            "billed {:.3} kWh at tariff {} for {:.2}",
                            reading.delta_kwh, tariff.name, cost
                        ),
                        Some(account.id),
                        Some(device.id),
                    )
                    .await?;
                }
                inserted
            }
            None => {
                // No tariff configured anywhere: energy accounting still
                // proceeds, only the monetary record is skipped.
                warn!(reading_id = ?reading.id, "no tariff configured, debiting energy without a transaction");
                self.record_event(
                    EventLevel::Warn,
                    "no_tariff",
                    "no active tariff configured; consumption debited without billing".to_string(),
                    Some(account.id),
                    Some(device.id),
                )
                .await?;
                true
            }
        };

        if !inserted {
            info!(reading_id = ?reading.id, "billing transaction already exists, skipping debit");
            return Ok(());
        }

        let Some(updated) = self
            .ledger
            .add_used(account.id, reading.delta_kwh)
            .await
            .map_err(EngineError::storage)?
        else {
            return Ok(());
        };

        self.evaluate_balance(&updated, Some(device.id)).await?;
        Ok(())
    }
}

/// Cost of one delta under a tariff, splitting grid and generator energy
/// when both the current and previous reading carry split counters.
fn compute_cost(
    reading: &MeterReading,
    previous: Option<&MeterReading>,
    tariff: &Tariff,
) -> Money {
    if let (Some(grid_now), Some(generator_now), Some(prev)) =
        (reading.grid_kwh, reading.generator_kwh, previous)
        && let (Some(grid_prev), Some(generator_prev)) = (prev.grid_kwh, prev.generator_kwh)
    {
        // A sub-meter that appears to have decreased is noise or a
        // rollover on that source; its contribution clamps to zero.
        let grid_delta = clamp_non_negative(grid_now - grid_prev);
        let generator_delta = clamp_non_negative(generator_now - generator_prev);
        return grid_delta * tariff.grid_rate + generator_delta * tariff.generator_rate;
    }

    reading.delta_kwh * tariff.grid_rate
}

fn clamp_non_negative(value: Kwh) -> Kwh {
    if value.into_inner() < 0.0 {
        Kwh::default()
    } else {
        value
    }
}
