//! Transport session for delivering image sections to the device.
//!
//! The device drives the transfer: the host polls its status before
//! and after every section write, and the device answers with the
//! section index it wants next. Two backends provide the physical
//! poll/write primitives — a UART stream link and a SPI register
//! bridge — behind one [`Transport`] trait; the [`Session`] state
//! machine is shared.

pub mod serial;
pub mod usbtiny;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::image::EepromImage;
use crate::protocol::{self, DeviceStatus};

/// Timing and retry constants for one backend.
///
/// These are tuned against the physical link rate and the firmware's
/// receive loop. Too-short delays corrupt the handshake; keep them
/// fixed constants, never derived.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    /// Status polls allowed while waiting for the device to report OK.
    pub ready_retries: u32,
    /// Status polls allowed while waiting for COMPLETE at the end.
    pub complete_retries: u32,
    /// Consecutive unanswered polls tolerated mid-transfer.
    pub poll_retries: u32,
    /// Pause after writing a section, before polling.
    pub settle_delay: Duration,
    /// Pause after resending a device-requested section.
    pub retry_delay: Duration,
    /// Pause between polls while the device reports BUSY.
    pub busy_delay: Duration,
}

/// Physical poll/write primitives for one link type.
///
/// Implementations own their link handle exclusively for the session's
/// lifetime. `query_status` degrades to [`DeviceStatus::Unknown`] on a
/// poll timeout instead of failing; hard I/O faults are errors.
#[async_trait]
pub trait Transport: Send {
    /// Open the link and bring the device to a pollable state.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Release the link. Must be safe to call after a failed transfer.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Ask the device for its current status.
    async fn query_status(&mut self) -> Result<DeviceStatus, TransportError>;

    /// Ask the device which section it expects next.
    async fn query_section(&mut self) -> Result<u8, TransportError>;

    /// Write one escaped section, terminator included.
    async fn write_section(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Backend-specific timing constants.
    fn tuning(&self) -> Tuning;
}

/// Session-level failures. Device-signaled RETRY and individual poll
/// timeouts are absorbed inside the session; these are the terminal
/// outcomes.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot communicate with device")]
    CannotCommunicate,

    #[error("device not responding")]
    Unresponsive,

    #[error("failed on section {0}")]
    SectionFailed(usize),

    #[error("incomplete transfer")]
    Incomplete,

    #[error("could not open link: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferReport {
    /// Sections the device acknowledged, table included. Fewer than
    /// the image holds when the device declared completion early.
    pub sections: usize,
    /// Unescaped payload bytes delivered, net of the per-section CRC
    /// bytes and the two-byte section count header.
    pub bytes: usize,
}

/// One transfer over one exclusively owned transport.
pub struct Session<T: Transport> {
    transport: T,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Deliver every section of `image`, consuming the session.
    ///
    /// The link is released on every exit path, success or failure.
    pub async fn transfer(mut self, image: &EepromImage) -> Result<TransferReport, TransportError> {
        self.transport.open().await?;
        let result = self.run(image).await;
        let closed = self.transport.close().await;
        match result {
            Ok(report) => {
                closed?;
                Ok(report)
            }
            // The transfer error is the interesting one; a close
            // failure on the way out is only logged.
            Err(err) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "failed to close link after error");
                }
                Err(err)
            }
        }
    }

    async fn run(&mut self, image: &EepromImage) -> Result<TransferReport, TransportError> {
        let tuning = self.transport.tuning();
        let stream = protocol::split_sections(&image.data);
        let sections = &stream.sections;

        info!(sections = sections.len(), "writing to EEPROM");

        // Wait until the device reports ready.
        let mut status = self.transport.query_status().await?;
        let mut retry = 0;
        while status != DeviceStatus::Ok {
            retry += 1;
            if retry > tuning.ready_retries {
                return Err(TransportError::CannotCommunicate);
            }
            status = self.transport.query_status().await?;
        }

        let mut device_section: usize = 0;

        while device_section < sections.len() {
            trace!(
                section = device_section,
                bytes = sections[device_section].len(),
                data = %hex::encode(&sections[device_section]),
                "writing section"
            );
            self.transport.write_section(&sections[device_section]).await?;
            sleep(tuning.settle_delay).await;

            status = self.transport.query_status().await?;
            let mut unanswered = 0;
            while status != DeviceStatus::Ok && status != DeviceStatus::Complete {
                match status {
                    DeviceStatus::Retry => {
                        // The device's claimed index is authoritative;
                        // it may not be the section just sent. It is
                        // still an untrusted wire byte.
                        let claimed = self.transport.query_section().await? as usize;
                        if claimed >= sections.len() {
                            warn!(section = claimed, "device requested a nonexistent section");
                            return Err(TransportError::SectionFailed(claimed));
                        }
                        device_section = claimed;
                        warn!(section = device_section, "retrying section");
                        self.transport.write_section(&sections[device_section]).await?;
                        sleep(tuning.retry_delay).await;
                    }
                    DeviceStatus::Error => {
                        return Err(TransportError::SectionFailed(device_section));
                    }
                    DeviceStatus::Busy => {
                        debug!("device busy, waiting");
                        sleep(tuning.busy_delay).await;
                    }
                    DeviceStatus::Unknown => {
                        unanswered += 1;
                        if unanswered > tuning.poll_retries {
                            return Err(TransportError::Unresponsive);
                        }
                    }
                    DeviceStatus::Ok | DeviceStatus::Complete => unreachable!(),
                }
                if status != DeviceStatus::Unknown {
                    unanswered = 0;
                }
                status = self.transport.query_status().await?;
            }

            if status == DeviceStatus::Complete {
                debug!(section = device_section, "device reported complete early");
                device_section += 1;
                break;
            }
            device_section = self.transport.query_section().await? as usize;
        }

        let mut retry = 0;
        while status != DeviceStatus::Complete {
            retry += 1;
            if retry > tuning.complete_retries {
                return Err(TransportError::Incomplete);
            }
            status = self.transport.query_status().await?;
        }

        // The device may declare the transfer complete before every
        // section went out; report what it acknowledged. Net out one
        // CRC byte per section and the section count header.
        let delivered = device_section.min(sections.len());
        let bytes = sections[..delivered]
            .iter()
            .map(|section| protocol::payload_len(section))
            .sum::<usize>()
            - delivered
            - 2;
        info!(sections = delivered, bytes, "transfer complete");
        Ok(TransferReport {
            sections: delivered,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{EncodeParams, encode};
    use crate::song::Song;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn zero_tuning() -> Tuning {
        Tuning {
            ready_retries: 3,
            complete_retries: 3,
            poll_retries: 3,
            settle_delay: Duration::from_millis(0),
            retry_delay: Duration::from_millis(0),
            busy_delay: Duration::from_millis(0),
        }
    }

    #[derive(Default)]
    struct MockState {
        statuses: VecDeque<DeviceStatus>,
        section_indices: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
        opened: bool,
        closed: bool,
    }

    /// Scripted device: statuses and section indices are popped in
    /// order; writes are recorded. The test keeps a clone to inspect
    /// after the session consumes its copy.
    #[derive(Clone)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn new(
            statuses: impl IntoIterator<Item = DeviceStatus>,
            section_indices: impl IntoIterator<Item = u8>,
        ) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    statuses: statuses.into_iter().collect(),
                    section_indices: section_indices.into_iter().collect(),
                    ..MockState::default()
                })),
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&mut self) -> Result<(), TransportError> {
            self.state().opened = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.state().closed = true;
            Ok(())
        }

        async fn query_status(&mut self) -> Result<DeviceStatus, TransportError> {
            Ok(self
                .state()
                .statuses
                .pop_front()
                .unwrap_or(DeviceStatus::Unknown))
        }

        async fn query_section(&mut self) -> Result<u8, TransportError> {
            Ok(self
                .state()
                .section_indices
                .pop_front()
                .expect("unexpected section query"))
        }

        async fn write_section(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.state().writes.push(data.to_vec());
            Ok(())
        }

        fn tuning(&self) -> Tuning {
            zero_tuning()
        }
    }

    fn test_image(channels: &[usize]) -> EepromImage {
        let songs: Vec<Song> = channels
            .iter()
            .enumerate()
            .map(|(i, &len)| Song::new(format!("song{i}")).with_channel(0, vec![i as u8; len]))
            .collect();
        encode(&songs, &EncodeParams::default()).unwrap()
    }

    use DeviceStatus::{Busy, Complete, Ok as StatusOk, Retry};

    #[tokio::test(start_paused = true)]
    async fn happy_path_sends_all_sections() {
        // 3 sections: table + two single-chunk channels.
        let image = test_image(&[10, 20]);
        let expected = protocol::split_sections(&image.data);

        let mock = MockTransport::new(
            [StatusOk, StatusOk, StatusOk, StatusOk, Complete],
            [1, 2, 3],
        );
        let report = Session::new(mock.clone()).transfer(&image).await.unwrap();

        assert_eq!(report.sections, 3);
        assert_eq!(report.bytes, expected.payload_bytes - 3 - 2);
        let state = mock.state();
        assert_eq!(state.writes.len(), 3);
        for (written, section) in state.writes.iter().zip(&expected.sections) {
            assert_eq!(written, &section.to_vec());
        }
        assert!(state.opened && state.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_resends_device_reported_section() {
        // 4 sections: table + three channels.
        let image = test_image(&[10, 20, 30]);
        let expected = protocol::split_sections(&image.data);
        assert_eq!(expected.sections.len(), 4);

        // Device acks sections 0..2, then answers RETRY for section 2
        // after section 3 was written.
        let mock = MockTransport::new(
            [
                StatusOk, // ready
                StatusOk, // after section 0
                StatusOk, // after section 1
                StatusOk, // after section 2
                Retry,    // after section 3: go back
                StatusOk, // after resend of section 2
                StatusOk, // after section 3 again
                Complete,
            ],
            [1, 2, 3, 2, 3, 4],
        );
        let report = Session::new(mock.clone()).transfer(&image).await.unwrap();

        assert_eq!(report.sections, 4);
        let state = mock.state();
        assert_eq!(state.writes.len(), 6);
        // The resend targets the device's claimed index, not the one
        // just sent.
        assert_eq!(state.writes[4], expected.sections[2].to_vec());
        assert_eq!(state.writes[5], expected.sections[3].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_exhausts_ready_budget() {
        let image = test_image(&[10]);
        let mock = MockTransport::new([Busy; 10], []);
        let err = Session::new(mock.clone()).transfer(&image).await.unwrap_err();

        assert!(matches!(err, TransportError::CannotCommunicate));
        let state = mock.state();
        assert!(state.writes.is_empty(), "no section may be sent before ready");
        assert!(state.closed, "link must be released on failure");
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_fails_with_section_index() {
        let image = test_image(&[10, 20]);
        let mock = MockTransport::new([StatusOk, StatusOk, DeviceStatus::Error], [1]);
        let err = Session::new(mock.clone()).transfer(&image).await.unwrap_err();
        assert!(matches!(err, TransportError::SectionFailed(1)));
        assert!(mock.state().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn early_complete_reports_acknowledged_progress() {
        let image = test_image(&[10, 20]);
        let expected = protocol::split_sections(&image.data);
        let mock = MockTransport::new([StatusOk, Complete], []);
        let report = Session::new(mock.clone()).transfer(&image).await.unwrap();

        assert_eq!(mock.state().writes.len(), 1, "only the table section went out");
        assert_eq!(report.sections, 1);
        // Table payload net of its CRC byte and the count header.
        assert_eq!(report.bytes, protocol::payload_len(&expected.sections[0]) - 1 - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_retry_index_aborts_cleanly() {
        // A noise byte can arrive where the device's section index
        // belongs; the session must fail, not index out of bounds.
        let image = test_image(&[10]);
        let mock = MockTransport::new([StatusOk, Retry], [200]);
        let err = Session::new(mock.clone()).transfer(&image).await.unwrap_err();

        assert!(matches!(err, TransportError::SectionFailed(200)));
        let state = mock.state();
        assert_eq!(state.writes.len(), 1, "nothing resent for a bogus index");
        assert!(state.closed, "link must be released on failure");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_completion_fails_bounded() {
        let image = test_image(&[10]);
        // 2 sections; all acked, but the device never reports COMPLETE.
        let mock = MockTransport::new(
            [StatusOk, StatusOk, StatusOk, Busy, Busy, Busy, Busy, Busy],
            [1, 2],
        );
        let err = Session::new(mock).transfer(&image).await.unwrap_err();
        assert!(matches!(err, TransportError::Incomplete));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_then_ok_continues_without_resend() {
        let image = test_image(&[10]);
        let mock = MockTransport::new([StatusOk, Busy, StatusOk, StatusOk, Complete], [1, 2]);
        let report = Session::new(mock.clone()).transfer(&image).await.unwrap();
        // BUSY never triggers a rewrite, only a re-poll.
        assert_eq!(mock.state().writes.len(), 2);
        assert_eq!(report.sections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_polls_exhaust_budget_mid_transfer() {
        let image = test_image(&[10]);
        // Ready, then nothing but silence after the first write.
        let mock = MockTransport::new([StatusOk], []);
        let err = Session::new(mock.clone()).transfer(&image).await.unwrap_err();
        assert!(matches!(err, TransportError::Unresponsive));
        assert_eq!(mock.state().writes.len(), 1);
    }
}
