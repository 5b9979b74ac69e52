use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid URI")]
    Uri,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open media: {0}")]
    Open(String),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("decoder error: {0}")]
    Decode(String),
}

/// Kind of a player-surface error; the absence of an error is represented
/// by `None` on the accessor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source could not be loaded, or it exposes no playable streams.
    Resource,
}
