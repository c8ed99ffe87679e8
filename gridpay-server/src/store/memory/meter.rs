use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gridpay_core::{AccountId, Connectivity, Device, DeviceId, Kwh, MeterReading};
use ordered_float::NotNan;

use super::MemoryStoreError;
use crate::store::MeterStore;

/// In-memory devices and readings.
#[derive(Clone, Default)]
pub struct MemoryMeterStore {
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
    readings: Arc<Mutex<HashMap<DeviceId, Vec<MeterReading>>>>,
}

#[async_trait]
impl MeterStore for MemoryMeterStore {
    type Error = MemoryStoreError;

    async fn add_device(&self, device: Device) -> Result<(), Self::Error> {
        let mut devices = self.devices.lock()?;
        devices.insert(device.id, device);
        Ok(())
    }

    async fn device(&self, id: DeviceId) -> Result<Option<Device>, Self::Error> {
        let devices = self.devices.lock()?;
        Ok(devices.get(&id).cloned())
    }

    async fn update_device(&self, id: DeviceId, new: Device) -> Result<(), Self::Error> {
        let mut devices = self.devices.lock()?;
        devices.insert(id, new);
        Ok(())
    }

    async fn devices_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Device>, Self::Error> {
        let devices = self.devices.lock()?;
        Ok(devices
            .values()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Self::Error> {
        let devices = self.devices.lock()?;
        Ok(devices.values().cloned().collect())
    }

    async fn insert_reading(&self, reading: MeterReading) -> Result<bool, Self::Error> {
        let mut readings = self.readings.lock()?;
        let stream = readings.entry(reading.device_id).or_default();

        if stream.iter().any(|r| r.timestamp == reading.timestamp) {
            return Ok(false);
        }

        stream.push(reading);
        Ok(true)
    }

    async fn latest_reading(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<MeterReading>, Self::Error> {
        let readings = self.readings.lock()?;
        Ok(readings
            .get(&device_id)
            .and_then(|stream| stream.iter().max_by_key(|r| r.timestamp))
            .cloned())
    }

    async fn readings_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Vec<MeterReading>, Self::Error> {
        let readings = self.readings.lock()?;
        let mut matching: Vec<MeterReading> = readings
            .get(&device_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|r| r.timestamp);
        Ok(matching)
    }

    async fn consumption_since(
        &self,
        device_id: DeviceId,
        since: jiff::Timestamp,
    ) -> Result<Kwh, Self::Error> {
        let readings = self.readings.lock()?;
        let total = readings
            .get(&device_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.timestamp >= since)
                    .map(|r| r.delta_kwh)
                    .fold(NotNan::default(), |acc, d| acc + d)
            })
            .unwrap_or_default();
        Ok(total)
    }

    async fn mark_seen(&self, id: DeviceId, at: jiff::Timestamp) -> Result<(), Self::Error> {
        let mut devices = self.devices.lock()?;
        if let Some(device) = devices.get_mut(&id) {
            device.last_seen = Some(at);
            device.connectivity = Connectivity::Online;
        }
        Ok(())
    }

    async fn mark_offline(
        &self,
        stale_before: jiff::Timestamp,
    ) -> Result<Vec<Device>, Self::Error> {
        let mut devices = self.devices.lock()?;
        let mut transitioned = Vec::new();

        for device in devices.values_mut() {
            let stale = device
                .last_seen
                .map(|seen| seen < stale_before)
                .unwrap_or(false);
            if device.connectivity == Connectivity::Online && stale {
                device.connectivity = Connectivity::Offline;
                transitioned.push(device.clone());
            }
        }

        Ok(transitioned)
    }

    async fn set_breaker_state(&self, id: DeviceId, state: bool) -> Result<(), Self::Error> {
        let mut devices = self.devices.lock()?;
        if let Some(device) = devices.get_mut(&id) {
            device.last_breaker_state = Some(state);
        }
        Ok(())
    }
}
