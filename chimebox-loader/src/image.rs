//! EEPROM image encoder.
//!
//! The image is an address table followed by a values region. The
//! table maps every song-channel slot to the EEPROM offset where that
//! channel's bytes land, with a leading song count and one trailing
//! entry marking the end of the payload. Each channel is split into
//! chunks no larger than the device receive buffer, checksummed,
//! escaped, and terminated with a section indicator; the table itself
//! is section 0. A two-byte section count rides unprotected ahead of
//! the table for transport bookkeeping and is never written to EEPROM.

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::crc;
use crate::protocol::{
    self, BUFFER_SIZE, NUM_CHANNELS, SECTION_INDICATOR, TABLE_ADDRESS_SIZE,
};
use crate::song::{Song, channel_name};

/// Geometry of the target EEPROM.
#[derive(Debug, Clone, Copy)]
pub struct EncodeParams {
    /// EEPROM page size in bytes.
    pub pagesize: u32,
    /// First EEPROM address available for song values; everything
    /// below it is reserved for the address table.
    pub address_start: u32,
    /// Total EEPROM size in bytes.
    pub size_memory: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            pagesize: 32,
            address_start: 0x100,
            size_memory: 0x2000,
        }
    }
}

impl EncodeParams {
    /// Reject geometry the firmware cannot address. Suspicious but
    /// workable geometry only warns.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.address_start % 2 != 0 {
            return Err(EncodeError::UnalignedAddressStart(self.address_start));
        }
        if self.address_start >= self.size_memory {
            return Err(EncodeError::AddressStartTooLarge {
                address_start: self.address_start,
                size_memory: self.size_memory,
            });
        }
        if self.pagesize > self.size_memory {
            return Err(EncodeError::PagesizeTooLarge {
                pagesize: self.pagesize,
                size_memory: self.size_memory,
            });
        }

        if !self.pagesize.is_power_of_two() {
            warn!(pagesize = self.pagesize, "pagesize is not a power of two");
        }
        if self.address_start as f64 > self.size_memory as f64 * 0.1 {
            let remaining = self.size_memory - self.address_start;
            let percent = 100 - (100 * self.address_start / self.size_memory);
            warn!(
                percent,
                remaining,
                size_memory = self.size_memory,
                "little memory available with given address_start"
            );
        }
        Ok(())
    }

    fn table_capacity(&self) -> u32 {
        self.address_start / TABLE_ADDRESS_SIZE as u32 - 2
    }
}

/// Fatal encoding failures. Encoding never retries; fix the input.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("address_start must be a multiple of 2: {0}")]
    UnalignedAddressStart(u32),

    #[error("address_start cannot be >= size_memory: {address_start} / {size_memory}")]
    AddressStartTooLarge { address_start: u32, size_memory: u32 },

    #[error("pagesize cannot be larger than size_memory: {pagesize} / {size_memory}")]
    PagesizeTooLarge { pagesize: u32, size_memory: u32 },

    #[error("cannot find Channel_A in song: {0}")]
    MissingChannelA(String),

    #[error("max bytes has been exceeded: {offset} / {size_memory}")]
    OffsetExceeded { offset: u32, size_memory: u32 },

    #[error("max entries has been exceeded: {entries} / {capacity}")]
    TableOverflow { entries: usize, capacity: u32 },
}

/// A fully framed EEPROM image ready for transport.
#[derive(Debug, Clone)]
pub struct EepromImage {
    /// Escaped byte stream: section-count header, table section, then
    /// one section per payload chunk.
    pub data: Bytes,
    /// Number of sections in the stream, table included.
    pub sections: u16,
    /// Bytes reserved for the address table.
    pub table_bytes: u32,
    /// Bytes of song payload past the table.
    pub song_bytes: u32,
}

/// Encode a song list into the packed EEPROM image.
pub fn encode(songs: &[Song], params: &EncodeParams) -> Result<EepromImage, EncodeError> {
    params.validate()?;

    let address_start = params.address_start as usize;
    let mut table = vec![0u8; address_start];
    let mut values: Vec<u8> = Vec::new();
    let mut offset = params.address_start;
    let mut entries: usize = 0;
    let mut sections: u16 = 0;

    for song in songs {
        info!(song = %song.name, "parsing song");

        for slot in 0..NUM_CHANNELS {
            let Some(channel) = song.channel(slot) else {
                if slot == 0 {
                    return Err(EncodeError::MissingChannelA(song.name.clone()));
                }
                debug!(
                    song = %song.name,
                    channel = %channel_name(slot),
                    "channel absent; duplicating previous table offset"
                );
                entries += 1;
                if (entries + 1) * TABLE_ADDRESS_SIZE >= address_start {
                    return Err(EncodeError::TableOverflow {
                        entries,
                        capacity: params.table_capacity(),
                    });
                }
                let prev = (entries - 1) * TABLE_ADDRESS_SIZE;
                table.copy_within(prev..prev + TABLE_ADDRESS_SIZE, prev + TABLE_ADDRESS_SIZE);
                continue;
            };

            trace!(
                channel = %channel_name(slot),
                offset,
                "channel table offset"
            );
            debug!(
                entry = entries,
                bytes = channel.len(),
                channel = %channel_name(slot),
                "read channel"
            );

            let start = offset;
            offset += channel.len() as u32;
            if offset > params.size_memory {
                return Err(EncodeError::OffsetExceeded {
                    offset,
                    size_memory: params.size_memory,
                });
            }
            entries += 1;
            // Leave room for the song count and the ending offset.
            if (entries + 1) * TABLE_ADDRESS_SIZE >= address_start {
                return Err(EncodeError::TableOverflow {
                    entries,
                    capacity: params.table_capacity(),
                });
            }
            write_entry(&mut table, entries, start);

            for (count, chunk) in channel.chunks(BUFFER_SIZE - 4).enumerate() {
                let crc = crc::crc(chunk);
                trace!(
                    section = sections + 1,
                    channel = %channel_name(slot),
                    chunk = count,
                    bytes = chunk.len(),
                    crc = %format_args!("{crc:#04x}"),
                    "chunk checksum"
                );
                let mut framed = Vec::with_capacity(chunk.len() + 1);
                framed.extend_from_slice(chunk);
                framed.push(crc);
                values.extend_from_slice(&protocol::escape(&framed));
                values.push(SECTION_INDICATOR);
                sections += 1;
            }
        }
    }

    // Trailing entry marks the end of the payload region.
    entries += 1;
    if (entries + 1) * TABLE_ADDRESS_SIZE > address_start {
        return Err(EncodeError::TableOverflow {
            entries,
            capacity: params.table_capacity(),
        });
    }
    write_entry(&mut table, entries, offset);

    let song_count = (entries / NUM_CHANNELS) as u16;
    table[..TABLE_ADDRESS_SIZE].copy_from_slice(&song_count.to_le_bytes());

    let table_crc = crc::crc(&table);
    trace!(crc = %format_args!("{table_crc:#04x}"), "table checksum");
    table.push(table_crc);
    sections += 1;

    // The section count is prepended unchecksummed; the device uses it
    // for progress tracking and discards it before the EEPROM write.
    let mut framed = Vec::with_capacity(TABLE_ADDRESS_SIZE + table.len());
    framed.extend_from_slice(&sections.to_le_bytes());
    framed.extend_from_slice(&table);

    let mut data = protocol::escape(&framed);
    data.push(SECTION_INDICATOR);
    data.extend_from_slice(&values);

    info!(
        songs = songs.len(),
        sections,
        table_bytes = address_start,
        song_bytes = offset - params.address_start,
        total_bytes = offset,
        "image encoded"
    );

    Ok(EepromImage {
        data: Bytes::from(data),
        sections,
        table_bytes: params.address_start,
        song_bytes: offset - params.address_start,
    })
}

fn write_entry(table: &mut [u8], slot: usize, offset: u32) {
    let at = slot * TABLE_ADDRESS_SIZE;
    table[at..at + TABLE_ADDRESS_SIZE].copy_from_slice(&(offset as u16).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ESCAPE_INDICATOR, split_sections};

    fn unescape(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut literal = false;
        for &byte in data {
            if byte == ESCAPE_INDICATOR && !literal {
                literal = true;
                continue;
            }
            out.push(byte);
            literal = false;
        }
        out
    }

    fn entry(table: &[u8], slot: usize) -> u16 {
        let at = slot * TABLE_ADDRESS_SIZE;
        u16::from_le_bytes([table[at], table[at + 1]])
    }

    fn params() -> EncodeParams {
        EncodeParams {
            pagesize: 32,
            address_start: 256,
            size_memory: 0x2000,
        }
    }

    #[test]
    fn two_single_channel_songs() {
        let songs = vec![
            Song::new("one").with_channel(0, vec![0x11; 10]),
            Song::new("two").with_channel(0, vec![0x22; 20]),
        ];
        let image = encode(&songs, &params()).unwrap();
        assert_eq!(image.sections, 3);
        assert_eq!(image.song_bytes, 30);

        let split = split_sections(&image.data);
        assert_eq!(split.sections.len(), 3);

        // Section 0 carries the header, the table, and the table CRC.
        let head = unescape(&split.sections[0]);
        assert_eq!(head.len(), 2 + 256 + 1 + 1); // header + table + crc + terminator
        assert_eq!(u16::from_le_bytes([head[0], head[1]]), 3); // section count
        let table = &head[2..2 + 256];
        assert_eq!(entry(table, 0), 2); // song count
        assert_eq!(entry(table, 1), 256);
        assert_eq!(entry(table, 2), 256); // absent channel B duplicates A
        assert_eq!(entry(table, 3), 266);
        assert_eq!(entry(table, 4), 266);
        assert_eq!(entry(table, 5), 286); // end of payload

        // One payload section per channel, data plus CRC byte.
        assert_eq!(unescape(&split.sections[1]).len(), 10 + 1 + 1);
        assert_eq!(unescape(&split.sections[2]).len(), 20 + 1 + 1);
    }

    #[test]
    fn final_offset_covers_all_channels() {
        let songs = vec![
            Song::new("duet")
                .with_channel(0, vec![1; 5])
                .with_channel(1, vec![2; 7]),
        ];
        let image = encode(&songs, &params()).unwrap();
        assert_eq!(image.sections, 3);

        let split = split_sections(&image.data);
        let head = unescape(&split.sections[0]);
        let table = &head[2..2 + 256];
        assert_eq!(entry(table, 0), 1); // one song
        assert_eq!(entry(table, 1), 256);
        assert_eq!(entry(table, 2), 261);
        assert_eq!(entry(table, 3), 268); // 256 + 5 + 7
    }

    #[test]
    fn oversized_channel_splits_at_buffer_limit() {
        let songs = vec![Song::new("long").with_channel(0, vec![0x5A; BUFFER_SIZE - 4 + 1])];
        let image = encode(&songs, &params()).unwrap();
        assert_eq!(image.sections, 3);

        let split = split_sections(&image.data);
        assert_eq!(unescape(&split.sections[1]).len(), (BUFFER_SIZE - 4) + 1 + 1);
        assert_eq!(unescape(&split.sections[2]).len(), 1 + 1 + 1);
    }

    #[test]
    fn rejects_odd_address_start() {
        let p = EncodeParams {
            address_start: 255,
            ..params()
        };
        assert!(matches!(
            encode(&[], &p),
            Err(EncodeError::UnalignedAddressStart(255))
        ));
    }

    #[test]
    fn rejects_address_start_at_memory_end() {
        let p = EncodeParams {
            address_start: 0x2000,
            ..params()
        };
        assert!(matches!(
            encode(&[], &p),
            Err(EncodeError::AddressStartTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_pagesize_beyond_memory() {
        let p = EncodeParams {
            pagesize: 0x4000,
            ..params()
        };
        assert!(matches!(
            encode(&[], &p),
            Err(EncodeError::PagesizeTooLarge { .. })
        ));
    }

    #[test]
    fn missing_channel_a_is_fatal() {
        let songs = vec![Song::new("broken").with_channel(1, vec![1, 2, 3])];
        let err = encode(&songs, &params()).unwrap_err();
        assert!(matches!(err, EncodeError::MissingChannelA(name) if name == "broken"));
    }

    #[test]
    fn offset_past_memory_fails_at_crossing_channel() {
        let p = EncodeParams {
            size_memory: 300,
            address_start: 28, // keep the table-share warning honest
            ..params()
        };
        let songs = vec![Song::new("fat").with_channel(0, vec![0; 273])];
        let err = encode(&songs, &p).unwrap_err();
        assert!(
            matches!(err, EncodeError::OffsetExceeded { offset: 301, size_memory: 300 }),
            "got {err:?}"
        );
    }

    #[test]
    fn table_region_overflow_is_fatal() {
        let p = EncodeParams {
            address_start: 4,
            ..params()
        };
        let songs = vec![Song::new("tiny").with_channel(0, vec![9])];
        assert!(matches!(
            encode(&songs, &p),
            Err(EncodeError::TableOverflow { entries: 1, .. })
        ));
    }
}
