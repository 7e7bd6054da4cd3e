//! Wire protocol shared by the image encoder and the transport session.
//!
//! Four byte values are reserved on the wire. Any payload byte equal to
//! one of them is preceded by the escape indicator at authoring time;
//! the firmware strips the escapes on receipt. The host only ever
//! escapes. A section is a run of escaped bytes terminated by an
//! unescaped section indicator; the address table is section 0 and each
//! payload chunk occupies one section after it.

use bytes::{BufMut, Bytes, BytesMut};
use strum::{Display, FromRepr};

/// Request byte asking the device for its current section index.
pub const POLL_SECTION_INDICATOR: u8 = 0xFC;
/// Request byte asking the device for its current status.
pub const POLL_STATUS_INDICATOR: u8 = 0xFD;
/// Terminates a section.
pub const SECTION_INDICATOR: u8 = 0xFE;
/// Marks the next byte as literal payload.
pub const ESCAPE_INDICATOR: u8 = 0xFF;

/// Receive buffer size on the device, shared with the firmware.
pub const BUFFER_SIZE: usize = 300;
/// Width of one address table entry in bytes.
pub const TABLE_ADDRESS_SIZE: usize = 2;
/// Channels per song. The firmware mixes two voices.
pub const NUM_CHANNELS: usize = 2;

/// Device status byte returned in response to a status poll.
///
/// Any byte outside the five defined codes maps to [`Unknown`]
/// (`DeviceStatus::Unknown`), which the session treats as
/// not-yet-ready rather than fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum DeviceStatus {
    Error = 0,
    Ok = 1,
    Busy = 2,
    Retry = 3,
    Complete = 4,
    Unknown = 5,
}

impl DeviceStatus {
    /// Decode a raw status byte, mapping unrecognized codes to `Unknown`.
    pub fn from_wire(byte: u8) -> Self {
        match Self::from_repr(byte) {
            Some(Self::Unknown) | None => Self::Unknown,
            Some(status) => status,
        }
    }
}

fn is_reserved(byte: u8) -> bool {
    matches!(
        byte,
        ESCAPE_INDICATOR | SECTION_INDICATOR | POLL_STATUS_INDICATOR | POLL_SECTION_INDICATOR
    )
}

/// Escapes every reserved byte in `data` by prefixing it with the
/// escape indicator. All other bytes pass through unchanged.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if is_reserved(byte) {
            escaped.push(ESCAPE_INDICATOR);
        }
        escaped.push(byte);
    }
    escaped
}

/// The escaped image stream re-segmented for transport.
#[derive(Debug)]
pub struct SectionStream {
    /// Discrete sections, each ending in its unescaped terminator.
    pub sections: Vec<Bytes>,
    /// Count of unescaped payload bytes across the whole stream
    /// (escaped sentinel values count once; bare indicators don't).
    pub payload_bytes: usize,
}

/// A byte carries payload unless it is a bare indicator or an escape
/// prefix; anything right behind an escape is literal.
fn is_payload(byte: u8, previous: u8) -> bool {
    (byte != SECTION_INDICATOR && byte != ESCAPE_INDICATOR) || previous == ESCAPE_INDICATOR
}

/// Counts the unescaped payload bytes in an escaped stream fragment.
/// Escaped sentinel values count once; bare indicators and escape
/// prefixes do not.
pub fn payload_len(data: &[u8]) -> usize {
    let mut count = 0;
    let mut previous_byte = 0u8;
    for &byte in data {
        if is_payload(byte, previous_byte) {
            count += 1;
        }
        previous_byte = byte;
    }
    count
}

/// Splits a fully escaped stream into transport sections.
///
/// A section indicator ends a section only when the immediately
/// preceding raw byte was not the escape indicator. The previous-byte
/// state carries across the whole stream, so a chunk boundary inside
/// an escape pair never produces a phantom section.
pub fn split_sections(data: &[u8]) -> SectionStream {
    let mut sections = Vec::new();
    let mut section = BytesMut::new();
    let mut payload_bytes = 0;
    let mut previous_byte = 0u8;

    for &byte in data {
        section.put_u8(byte);
        if is_payload(byte, previous_byte) {
            payload_bytes += 1;
        }
        if byte == SECTION_INDICATOR && previous_byte != ESCAPE_INDICATOR {
            sections.push(section.split().freeze());
        }
        previous_byte = byte;
    }

    SectionStream {
        sections,
        payload_bytes,
    }
}
