//! SPI register backend over a USBtinyISP bit-bang bridge.
//!
//! The bridge exposes vendor control requests that bit-bang the SPI
//! bus toward the device. Every byte of a section is its own blocking
//! request. The bridge pipeline is one transfer deep, so a poll must
//! issue its read twice: the first answer is stale, the second is
//! authoritative. Power must be applied before the session and removed
//! on every exit path.

use std::time::Duration;

use async_trait::async_trait;
use rusb::{Direction, GlobalContext, Recipient, RequestType, request_type};
use tokio::time::sleep;
use tracing::{info, trace};

use super::{Transport, TransportError, Tuning};
use crate::protocol::{DeviceStatus, POLL_SECTION_INDICATOR, POLL_STATUS_INDICATOR};

const USBTINY_VID: u16 = 0x1781;
const USBTINY_PID: u16 = 0x0C9F;

// Vendor request numbers, from the USBtiny firmware.
const REQ_POWERUP: u8 = 5;
const REQ_POWERDOWN: u8 = 6;
const REQ_SET: u8 = 4;
const REQ_SPI1: u8 = 14;

const SCK_PERIOD_DEFAULT: u16 = 10;
const RESET_HIGH: u16 = 1;
/// Chip select line on the bridge's port.
const CS_BIT: u16 = 4;

const USB_TIMEOUT: Duration = Duration::from_millis(500);
/// Gap before each half of a double read, tuned against the bridge
/// latency.
const POLL_GAP: Duration = Duration::from_millis(40);
/// Time for the device rails to stabilize after power-up.
const POWER_DELAY: Duration = Duration::from_millis(100);

const TUNING: Tuning = Tuning {
    ready_retries: 50,
    complete_retries: 50,
    poll_retries: 10,
    settle_delay: Duration::from_millis(40),
    retry_delay: Duration::from_millis(100),
    busy_delay: Duration::from_millis(100),
};

/// Exclusive handle to the USBtiny bridge for one session.
pub struct UsbTinyBridge {
    handle: Option<rusb::DeviceHandle<GlobalContext>>,
}

impl UsbTinyBridge {
    pub fn new() -> Self {
        Self { handle: None }
    }

    fn handle(&mut self) -> Result<&rusb::DeviceHandle<GlobalContext>, TransportError> {
        self.handle
            .as_ref()
            .ok_or_else(|| TransportError::Unavailable("USBtiny bridge not open".into()))
    }

    fn control_in(&mut self, request: u8, value: u16, index: u16) -> Result<u8, TransportError> {
        let mut data = [0u8; 1];
        self.handle()?.read_control(
            request_type(Direction::In, RequestType::Vendor, Recipient::Device),
            request,
            value,
            index,
            &mut data,
            USB_TIMEOUT,
        )?;
        Ok(data[0])
    }

    fn command(&mut self, request: u8, value: u16, index: u16) -> Result<(), TransportError> {
        let mut data = [];
        self.handle()?.read_control(
            request_type(Direction::In, RequestType::Vendor, Recipient::Device),
            request,
            value,
            index,
            &mut data,
            USB_TIMEOUT,
        )?;
        Ok(())
    }

    /// Clock one byte over SPI and return the byte shifted back.
    fn spi1(&mut self, byte: u8) -> Result<u8, TransportError> {
        self.control_in(REQ_SPI1, byte as u16, 0)
    }

    fn cs_high(&mut self) -> Result<(), TransportError> {
        self.command(REQ_SET, CS_BIT, 0)
    }

    fn power_off(&mut self) -> Result<(), TransportError> {
        self.command(REQ_POWERDOWN, 0, 0)
    }

    /// One half-poll. A `Timeout` from the bridge degrades to `None`;
    /// anything else is a hard fault.
    fn read_register(&mut self, indicator: u8) -> Result<Option<u8>, TransportError> {
        match self.spi1(indicator) {
            Ok(byte) => Ok(Some(byte)),
            Err(TransportError::Usb(rusb::Error::Timeout)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Double read: prime the bridge pipeline, then take the second
    /// answer as authoritative.
    async fn poll(&mut self, indicator: u8) -> Result<Option<u8>, TransportError> {
        sleep(POLL_GAP).await;
        let _stale = self.read_register(indicator)?;
        sleep(POLL_GAP).await;
        self.read_register(indicator)
    }
}

impl Default for UsbTinyBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UsbTinyBridge {
    async fn open(&mut self) -> Result<(), TransportError> {
        let handle = rusb::open_device_with_vid_pid(USBTINY_VID, USBTINY_PID)
            .ok_or_else(|| TransportError::Unavailable("USBtiny programmer not connected".into()))?;
        self.handle = Some(handle);
        info!("using SPI via USBtinyISP");

        self.command(REQ_POWERUP, SCK_PERIOD_DEFAULT, RESET_HIGH)?;
        sleep(POWER_DELAY).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            self.power_off()?;
            self.handle = None;
        }
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
        for &byte in data {
            self.spi1(byte)?;
        }
        self.cs_high()
    }

    fn tuning(&self) -> Tuning {
        TUNING
    }
}

impl Drop for UsbTinyBridge {
    /// Last-ditch power removal if the session is interrupted before
    /// `close` runs.
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.power_off();
        }
    }
}
