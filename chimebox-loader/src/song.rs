//! Song data model and JSON input loading.
//!
//! The note-conversion step (out of tree) emits a JSON array of song
//! objects, each carrying a `Filename` plus one byte array per channel
//! (`Channel_A`, `Channel_B`, ...). Channel A is mandatory; trailing
//! channels may be absent, which the encoder treats as zero-length.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

/// One musical unit producing one or more channel byte sequences.
#[derive(Debug, Clone, Deserialize)]
pub struct Song {
    /// Source filename the song was converted from.
    #[serde(rename = "Filename")]
    pub name: String,

    /// Channel byte sequences keyed by their JSON field name.
    #[serde(flatten)]
    channels: BTreeMap<String, Vec<u8>>,
}

impl Song {
    /// Create an empty song. Channels are added with [`Song::with_channel`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: BTreeMap::new(),
        }
    }

    /// Builder-style channel insertion, mainly for tests and tooling.
    pub fn with_channel(mut self, slot: usize, data: Vec<u8>) -> Self {
        self.channels.insert(channel_key(slot), data);
        self
    }

    /// Channel data for slot 0 (`A`), 1 (`B`), ... if present.
    pub fn channel(&self, slot: usize) -> Option<&[u8]> {
        self.channels.get(&channel_key(slot)).map(Vec::as_slice)
    }
}

/// Letter name for a channel slot, as used in field names and logs.
pub fn channel_name(slot: usize) -> char {
    (b'A' + slot as u8) as char
}

fn channel_key(slot: usize) -> String {
    format!("Channel_{}", channel_name(slot))
}

/// Errors raised while loading the song input file.
#[derive(Debug, thiserror::Error)]
pub enum SongError {
    #[error("failed to open file: {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse file: {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Load the converted song list from a JSON file.
pub fn load_songs(path: impl AsRef<Path>) -> Result<Vec<Song>, SongError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| SongError::Open {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|source| SongError::Parse {
        path: path.display().to_string(),
        source,
    })
}
