pub mod mock;
pub mod modbus;

pub use mock::MockBreakerDriver;
pub use modbus::ModbusBreakerDriver;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read-back failed: {0}")]
    ReadBackFailed(String),
    #[error("device returned exception code {0}")]
    DeviceException(u8),
}

/// Physical relay access. One call performs the write and verifies it by
/// reading the state back; the returned boolean is the verified state,
/// which may differ from the target if the relay did not move.
#[async_trait]
pub trait BreakerDriver: Send + Sync + 'static {
    async fn set_breaker(
        &self,
        address: &str,
        unit_id: u8,
        coil: u16,
        target: bool,
    ) -> Result<bool, DriverError>;
}
