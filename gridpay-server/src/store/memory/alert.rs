use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gridpay_core::{AccountId, Alert, AlertKind, OpsEvent};

use super::MemoryStoreError;
use crate::store::AlertStore;

/// In-memory alerts and operational events.
#[derive(Clone, Default)]
pub struct MemoryAlertStore {
    alerts: Arc<Mutex<Vec<Alert>>>,
    events: Arc<Mutex<Vec<OpsEvent>>>,
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    type Error = MemoryStoreError;

    async fn open_if_absent(&self, alert: Alert) -> Result<bool, Self::Error> {
        let mut alerts = self.alerts.lock()?;

        // Check and insert under one lock so racing callers cannot both
        // win.
        let already_open = alerts
            .iter()
            .any(|a| a.open && a.account_id == alert.account_id && a.kind == alert.kind);
        if already_open {
            return Ok(false);
        }

        alerts.push(alert);
        Ok(true)
    }

    async fn resolve(
        &self,
        account_id: AccountId,
        kind: AlertKind,
        at: jiff::Timestamp,
    ) -> Result<usize, Self::Error> {
        let mut alerts = self.alerts.lock()?;
        let mut resolved = 0;

        for alert in alerts
            .iter_mut()
            .filter(|a| a.open && a.account_id == account_id && a.kind == kind)
        {
            alert.open = false;
            alert.resolved_at = Some(at);
            resolved += 1;
        }

        Ok(resolved)
    }

    async fn open_alerts(&self, account_id: AccountId) -> Result<Vec<Alert>, Self::Error> {
        let alerts = self.alerts.lock()?;
        Ok(alerts
            .iter()
            .filter(|a| a.open && a.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: OpsEvent) -> Result<(), Self::Error> {
        let mut events = self.events.lock()?;
        events.push(event);
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<OpsEvent>, Self::Error> {
        let events = self.events.lock()?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
