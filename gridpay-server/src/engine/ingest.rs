use gridpay_core::{
    AlertKind, DeviceId, DeviceState, EventLevel, Kwh, MeterReading, ReadingId, ReadingQuality,
};
use ordered_float::NotNan;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

/// One sample as delivered by the data-acquisition collaborator.
#[derive(Debug, Clone)]
pub struct IngestReading {
    pub device_id: DeviceId,
    pub timestamp: jiff::Timestamp,
    /// Cumulative total energy counter. Required; a sample without it is
    /// rejected.
    pub energy_kwh: Option<f64>,
    pub grid_kwh: Option<f64>,
    pub generator_kwh: Option<f64>,
    pub power_kw: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub quality: ReadingQuality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        reading_id: ReadingId,
        delta_kwh: Kwh,
    },
    /// A reading for this device and timestamp was already ingested.
    /// Redelivery is absorbed here, before any billing runs.
    Duplicate,
    Rejected {
        reason: RejectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingEnergy,
    NegativeEnergy,
    NonFiniteEnergy,
    UnknownDevice,
    DeviceDisabled,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::MissingEnergy => "missing total energy counter",
            RejectReason::NegativeEnergy => "negative energy counter",
            RejectReason::NonFiniteEnergy => "non-finite energy counter",
            RejectReason::UnknownDevice => "unknown device",
            RejectReason::DeviceDisabled => "device is disabled",
        };
        f.write_str(text)
    }
}

impl<M, L, A, C> Engine<M, L, A, C>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    /// Ingest one raw sample: validate, compute the consumption delta
    /// against the previous reading, persist, and feed billing.
    pub async fn ingest(&self, sample: IngestReading) -> Result<IngestOutcome, EngineError> {
        let total = match validate_counter(sample.energy_kwh) {
            Ok(Some(value)) => value,
            Ok(None) => return self.reject(&sample, RejectReason::MissingEnergy).await,
            Err(reason) => return self.reject(&sample, reason).await,
        };
        let grid = match validate_counter(sample.grid_kwh) {
            Ok(value) => value,
            Err(reason) => return self.reject(&sample, reason).await,
        };
        let generator = match validate_counter(sample.generator_kwh) {
            Ok(value) => value,
            Err(reason) => return self.reject(&sample, reason).await,
        };

        let device = match self
            .meters
            .device(sample.device_id)
            .await
            .map_err(EngineError::storage)?
        {
            Some(device) => device,
            None => return self.reject(&sample, RejectReason::UnknownDevice).await,
        };
        if device.state == DeviceState::Disabled {
            return self.reject(&sample, RejectReason::DeviceDisabled).await;
        }

        let previous = self
            .meters
            .latest_reading(device.id)
            .await
            .map_err(EngineError::storage)?;

        let delta = match &previous {
            None => Kwh::default(),
            Some(prev) if total < prev.energy_kwh => {
                // Counter rollover or meter reset. Consumption for the
                // rollover period is deliberately not estimated.
                info!(
                    device_id = ?device.id,
                    previous = prev.energy_kwh.into_inner(),
                    current = total.into_inner(),
                    "counter went backwards, treating as reset"
                );
                Kwh::default()
            }
            Some(prev) => total - prev.energy_kwh,
        };

        let reading = MeterReading {
            id: ReadingId(Ulid::new()),
            device_id: device.id,
            timestamp: sample.timestamp,
            energy_kwh: total,
            grid_kwh: grid,
            generator_kwh: generator,
            power_kw: snapshot(sample.power_kw),
            voltage: snapshot(sample.voltage),
            current: snapshot(sample.current),
            frequency: snapshot(sample.frequency),
            power_factor: snapshot(sample.power_factor),
            delta_kwh: delta,
            quality: sample.quality,
        };
        let reading_id = reading.id;

        let inserted = self
            .meters
            .insert_reading(reading.clone())
            .await
            .map_err(EngineError::storage)?;
        if !inserted {
            debug!(device_id = ?device.id, timestamp = %sample.timestamp, "duplicate reading ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        self.meters
            .mark_seen(device.id, jiff::Timestamp::now())
            .await
            .map_err(EngineError::storage)?;
        let reconnected = self
            .alerts
            .resolve(device.account_id, AlertKind::DeviceOffline, jiff::Timestamp::now())
            .await
            .map_err(EngineError::storage)?;
        if reconnected > 0 {
            info!(device_id = ?device.id, "device back online");
        }

        if delta.into_inner() > 0.0 {
            self.apply_billing(&device, &reading, previous.as_ref())
                .await?;
        }

        Ok(IngestOutcome::Accepted {
            reading_id,
            delta_kwh: delta,
        })
    }

    async fn reject(
        &self,
        sample: &IngestReading,
        reason: RejectReason,
    ) -> Result<IngestOutcome, EngineError> {
        warn!(device_id = ?sample.device_id, %reason, "reading rejected");
        self.record_event(
            EventLevel::Warn,
            "reading_rejected",
            format!("reading rejected: {reason}"),
            None,
            Some(sample.device_id),
        )
        .await?;
        Ok(IngestOutcome::Rejected { reason })
    }
}

/// Validate an optional cumulative counter: present values must be finite
/// and non-negative.
fn validate_counter(raw: Option<f64>) -> Result<Option<Kwh>, RejectReason> {
    match raw {
        None => Ok(None),
        Some(value) if !value.is_finite() => Err(RejectReason::NonFiniteEnergy),
        Some(value) if value < 0.0 => Err(RejectReason::NegativeEnergy),
        Some(value) => Ok(Some(NotNan::new(value).map_err(|_| RejectReason::NonFiniteEnergy)?)),
    }
}

/// Instantaneous values are informational; non-finite junk is dropped
/// rather than rejected.
fn snapshot(raw: Option<f64>) -> Option<NotNan<f64>> {
    raw.filter(|v| v.is_finite()).and_then(|v| NotNan::new(v).ok())
}

#[cfg(test)]
mod tests {
    use gridpay_core::DeviceId;

    use super::super::testutil::{account, device, flat_tariff, kwh, memory_engine, MemoryEngine};
    use super::*;
    use crate::store::{LedgerStore as _, MeterStore as _};

    fn sample(device_id: DeviceId, ts: &str, total: f64) -> IngestReading {
        IngestReading {
            device_id,
            timestamp: ts.parse().unwrap(),
            energy_kwh: Some(total),
            grid_kwh: None,
            generator_kwh: None,
            power_kw: Some(0.8),
            voltage: Some(230.0),
            current: Some(4.1),
            frequency: Some(50.0),
            power_factor: Some(0.95),
            quality: ReadingQuality::Good,
        }
    }

    async fn seeded() -> (MemoryEngine, DeviceId) {
        let engine = memory_engine();
        let acct = account(100.0, 0.0);
        let dev = device(acct.id);
        let device_id = dev.id;
        engine.ledger.add_account(acct).await.unwrap();
        engine.ledger.add_tariff(flat_tariff(0.5, 0.9)).await.unwrap();
        engine.meters.add_device(dev).await.unwrap();
        (engine, device_id)
    }

    #[tokio::test]
    async fn first_reading_establishes_baseline() {
        let (engine, device_id) = seeded().await;

        let outcome = engine
            .ingest(sample(device_id, "2025-03-01T10:00:00Z", 120.0))
            .await
            .unwrap();
        match outcome {
            IngestOutcome::Accepted { delta_kwh, .. } => assert_eq!(delta_kwh, kwh(0.0)),
            other => panic!("expected accepted baseline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delta_is_difference_of_consecutive_totals() {
        let (engine, device_id) = seeded().await;

        engine
            .ingest(sample(device_id, "2025-03-01T10:00:00Z", 120.0))
            .await
            .unwrap();
        let outcome = engine
            .ingest(sample(device_id, "2025-03-01T11:00:00Z", 121.8))
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Accepted { delta_kwh, .. } => {
                assert!((delta_kwh.into_inner() - 1.8).abs() < 1e-9)
            }
            other => panic!("expected accepted reading, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decreasing_counter_is_a_reset_with_zero_delta() {
        let (engine, device_id) = seeded().await;

        engine
            .ingest(sample(device_id, "2025-03-01T10:00:00Z", 120.0))
            .await
            .unwrap();
        let outcome = engine
            .ingest(sample(device_id, "2025-03-01T11:00:00Z", 3.0))
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Accepted { delta_kwh, .. } => assert_eq!(delta_kwh, kwh(0.0)),
            other => panic!("expected accepted reset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_and_negative_totals_are_rejected() {
        let (engine, device_id) = seeded().await;

        let mut missing = sample(device_id, "2025-03-01T10:00:00Z", 0.0);
        missing.energy_kwh = None;
        assert_eq!(
            engine.ingest(missing).await.unwrap(),
            IngestOutcome::Rejected {
                reason: RejectReason::MissingEnergy
            }
        );

        assert_eq!(
            engine
                .ingest(sample(device_id, "2025-03-01T10:00:00Z", -4.0))
                .await
                .unwrap(),
            IngestOutcome::Rejected {
                reason: RejectReason::NegativeEnergy
            }
        );

        // Nothing was persisted for the device.
        assert!(engine.meters.latest_reading(device_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let (engine, _) = seeded().await;

        let outcome = engine
            .ingest(sample(DeviceId(ulid::Ulid::new()), "2025-03-01T10:00:00Z", 1.0))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Rejected {
                reason: RejectReason::UnknownDevice
            }
        );
    }

    #[tokio::test]
    async fn redelivery_is_a_duplicate_not_a_second_reading() {
        let (engine, device_id) = seeded().await;

        engine
            .ingest(sample(device_id, "2025-03-01T10:00:00Z", 120.0))
            .await
            .unwrap();
        engine
            .ingest(sample(device_id, "2025-03-01T11:00:00Z", 122.0))
            .await
            .unwrap();

        let replay = engine
            .ingest(sample(device_id, "2025-03-01T11:00:00Z", 122.0))
            .await
            .unwrap();
        assert_eq!(replay, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn accepted_reading_marks_device_online() {
        let (engine, device_id) = seeded().await;

        engine
            .ingest(sample(device_id, "2025-03-01T10:00:00Z", 120.0))
            .await
            .unwrap();

        let device = engine.meters.device(device_id).await.unwrap().unwrap();
        assert_eq!(device.connectivity, gridpay_core::Connectivity::Online);
        assert!(device.last_seen.is_some());
    }
}
