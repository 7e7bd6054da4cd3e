//! Song EEPROM image encoder and loader for chimebox devices.
//!
//! Converted song data goes through three stages: the [`image`]
//! encoder packs channels into a checksummed, escaped address table
//! plus values region; the [`protocol`] framer splits the stream into
//! device-sized sections; and a [`transport`] session delivers the
//! sections over UART or a USBtinyISP SPI bridge, following the
//! device's poll/retry handshake. [`flashtool`] wraps the external
//! avrdude scripts that handle program memory.

pub mod crc;
pub mod error;
pub mod flashtool;
pub mod image;
pub mod protocol;
pub mod song;
pub mod transport;

pub use error::{Error, Result};
pub use image::{EepromImage, EncodeParams, encode};
pub use song::{Song, load_songs};
pub use transport::{Session, TransferReport, Transport};
