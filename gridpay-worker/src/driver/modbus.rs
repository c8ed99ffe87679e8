use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{BreakerDriver, DriverError};

/// Modbus TCP port.
const MODBUS_PORT: u16 = 502;
/// Holding register driving the switch outputs (device manual, table
/// "Switch outputs").
const WRITE_REGISTER: u16 = 60008;
/// Holding register exposing the digital-output status word.
const READ_REGISTER: u16 = 207;
/// Bit within the status word carrying digital output 0.0.
const STATUS_BITMASK: u16 = 0x0001;

const FC_READ_HOLDING: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;

/// Modbus TCP driver for the metering hardware's disconnect relay.
///
/// The relay is driven through a single holding register write: byte 1
/// carries the action (1 = close, 0 = open), byte 0 the output id, so the
/// combined word is 256 for ON and 0 for OFF. The write is verified by
/// reading the status register back and masking out the output bit.
#[derive(Default)]
pub struct ModbusBreakerDriver {
    transaction: AtomicU16,
}

impl ModbusBreakerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_transaction(&self) -> u16 {
        self.transaction.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(
        &self,
        stream: &mut TcpStream,
        unit_id: u8,
        function: u8,
        register: u16,
        value: u16,
    ) -> Result<Vec<u8>, DriverError> {
        let tid = self.next_transaction();
        let mut frame = Vec::with_capacity(12);
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]); // protocol id
        frame.extend_from_slice(&6u16.to_be_bytes()); // unit + pdu length
        frame.push(unit_id);
        frame.push(function);
        frame.extend_from_slice(&register.to_be_bytes());
        frame.extend_from_slice(&value.to_be_bytes());

        stream
            .write_all(&frame)
            .await
            .map_err(|e| DriverError::WriteFailed(e.to_string()))?;

        let mut header = [0u8; 7];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| DriverError::ReadBackFailed(e.to_string()))?;
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return Err(DriverError::ReadBackFailed(format!(
                "short response, length {length}"
            )));
        }

        // Length counts the unit id byte already consumed with the header.
        let mut pdu = vec![0u8; length - 1];
        stream
            .read_exact(&mut pdu)
            .await
            .map_err(|e| DriverError::ReadBackFailed(e.to_string()))?;

        if pdu[0] == function | 0x80 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(DriverError::DeviceException(code));
        }
        if pdu[0] != function {
            return Err(DriverError::ReadBackFailed(format!(
                "unexpected function code {:#04x}",
                pdu[0]
            )));
        }

        Ok(pdu)
    }
}

#[async_trait]
impl BreakerDriver for ModbusBreakerDriver {
    async fn set_breaker(
        &self,
        address: &str,
        unit_id: u8,
        coil: u16,
        target: bool,
    ) -> Result<bool, DriverError> {
        let mut stream = TcpStream::connect((address, MODBUS_PORT))
            .await
            .map_err(|e| DriverError::ConnectFailed(format!("{address}: {e}")))?;

        let value = if target { 256 } else { 0 };
        debug!(address, unit_id, coil, value, register = WRITE_REGISTER, "FC06 write");
        self.request(&mut stream, unit_id, FC_WRITE_SINGLE, WRITE_REGISTER, value)
            .await?;

        debug!(address, unit_id, register = READ_REGISTER, "FC03 read-back");
        let pdu = self
            .request(&mut stream, unit_id, FC_READ_HOLDING, READ_REGISTER, 1)
            .await?;
        if pdu.len() < 4 {
            return Err(DriverError::ReadBackFailed(format!(
                "short read response, {} bytes",
                pdu.len()
            )));
        }
        let word = u16::from_be_bytes([pdu[2], pdu[3]]);

        Ok(word & STATUS_BITMASK != 0)
    }
}
