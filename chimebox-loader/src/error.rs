//! Crate-level error type.

/// Any failure surfaced by the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Song(#[from] crate::song::SongError),

    #[error(transparent)]
    Encode(#[from] crate::image::EncodeError),

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    Flash(#[from] crate::flashtool::FlashError),
}

pub type Result<T> = std::result::Result<T, Error>;
