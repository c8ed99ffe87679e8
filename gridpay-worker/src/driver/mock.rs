use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use super::{BreakerDriver, DriverError};

/// In-process relay simulation.
///
/// Remembers the state of every (address, coil) pair it has touched and
/// can inject failures at a configurable rate for exercising the retry
/// path.
#[derive(Clone, Default)]
pub struct MockBreakerDriver {
    relays: Arc<Mutex<HashMap<(String, u16), bool>>>,
    fail_rate: f64,
}

impl MockBreakerDriver {
    pub fn new(fail_rate: f64) -> Self {
        Self {
            relays: Arc::new(Mutex::new(HashMap::new())),
            fail_rate: fail_rate.clamp(0.0, 1.0),
        }
    }

    /// Current simulated state of a relay, if it was ever driven.
    pub fn relay_state(&self, address: &str, coil: u16) -> Option<bool> {
        self.relays
            .lock()
            .ok()
            .and_then(|relays| relays.get(&(address.to_string(), coil)).copied())
    }
}

#[async_trait]
impl BreakerDriver for MockBreakerDriver {
    async fn set_breaker(
        &self,
        address: &str,
        _unit_id: u8,
        coil: u16,
        target: bool,
    ) -> Result<bool, DriverError> {
        let unlucky = rand::rng().random::<f64>() < self.fail_rate;
        if unlucky {
            return Err(DriverError::WriteFailed(format!(
                "simulated write failure to {address}"
            )));
        }

        let mut relays = self
            .relays
            .lock()
            .map_err(|e| DriverError::WriteFailed(e.to_string()))?;
        relays.insert((address.to_string(), coil), target);
        debug!(address, coil, target, "mock relay switched");

        // Read-back mirrors what a real verify would return.
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn switch_and_read_back() {
        let driver = MockBreakerDriver::new(0.0);

        let state = driver.set_breaker("10.0.0.17", 1, 5, true).await.unwrap();
        assert!(state);
        assert_eq!(driver.relay_state("10.0.0.17", 5), Some(true));

        let state = driver.set_breaker("10.0.0.17", 1, 5, false).await.unwrap();
        assert!(!state);
        assert_eq!(driver.relay_state("10.0.0.17", 5), Some(false));
    }

    #[tokio::test]
    async fn always_failing_driver_errors() {
        let driver = MockBreakerDriver::new(1.0);
        assert!(driver.set_breaker("10.0.0.17", 1, 5, true).await.is_err());
        assert_eq!(driver.relay_state("10.0.0.17", 5), None);
    }
}
