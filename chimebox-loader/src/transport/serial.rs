//! UART stream backend, used with an FTDI cable.
//!
//! Polls are single-byte request/response exchanges: the host writes a
//! poll indicator and reads one answer byte within a short timeout.
//! Sections go out as whole buffers followed by a settle delay so the
//! firmware can drain its receive buffer.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, trace};

use super::{Transport, TransportError, Tuning};
use crate::protocol::{DeviceStatus, POLL_SECTION_INDICATOR, POLL_STATUS_INDICATOR};

const BAUD_RATE: u32 = 115_200;
/// How long the target takes to leave reset after the port opens.
const RESET_DELAY: Duration = Duration::from_secs(3);
/// Per-poll response deadline.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Gap before each poll request byte, tuned against the firmware's
/// receive loop.
const POLL_GAP: Duration = Duration::from_millis(10);

const TUNING: Tuning = Tuning {
    ready_retries: 10,
    complete_retries: 50,
    poll_retries: 10,
    settle_delay: Duration::from_millis(150),
    retry_delay: Duration::from_millis(100),
    busy_delay: Duration::from_millis(100),
};

/// Exclusive handle to the UART link for one session.
pub struct SerialLink {
    path: String,
    port: Option<SerialStream>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::Unavailable("serial port not open".into()))
    }

    /// Write a poll indicator and read the one-byte answer, or `None`
    /// on timeout.
    async fn poll(&mut self, indicator: u8) -> Result<Option<u8>, TransportError> {
        sleep(POLL_GAP).await;
        let port = self.port()?;
        port.write_all(&[indicator]).await?;

        let mut answer = [0u8; 1];
        match timeout(POLL_TIMEOUT, port.read_exact(&mut answer)).await {
            Ok(read) => {
                read?;
                // Drop anything queued behind the answer byte so the
                // next poll starts clean.
                let _ = port.clear(ClearBuffer::Input);
                Ok(Some(answer[0]))
            }
            Err(_elapsed) => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for SerialLink {
    async fn open(&mut self) -> Result<(), TransportError> {
        let port = tokio_serial::new(&self.path, BAUD_RATE)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .data_bits(DataBits::Eight)
            .open_native_async()
            .map_err(|err| {
                TransportError::Unavailable(format!(
                    "could not open serial port {}: {err}; check device permissions",
                    self.path
                ))
            })?;
        self.port = Some(port);
        info!(device = %self.path, "using UART via FTDI cable");

        debug!("resetting target");
        sleep(RESET_DELAY).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.port = None;
        Ok(())
    }

    async fn query_status(&mut self) -> Result<DeviceStatus, TransportError> {
        let status = match self.poll(POLL_STATUS_INDICATOR).await? {
            Some(byte) => DeviceStatus::from_wire(byte),
            None => DeviceStatus::Unknown,
        };
        trace!(%status, "device status");
        Ok(status)
    }

    async fn query_section(&mut self) -> Result<u8, TransportError> {
        let section = self.poll(POLL_SECTION_INDICATOR).await?.unwrap_or(0);
        trace!(section, "device section");
        Ok(section)
    }

    async fn write_section(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(data).await?;
        port.flush().await?;
        Ok(())
    }

    fn tuning(&self) -> Tuning {
        TUNING
    }
}
