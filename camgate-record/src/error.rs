use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Ring is closed")]
    RingClosed,

    #[error("Ring misconfigured: {0}")]
    Misconfigured(&'static str),

    #[error("No open segment for the current window")]
    NoOpenSegment,
}

pub type Result<T> = std::result::Result<T, RecordError>;
