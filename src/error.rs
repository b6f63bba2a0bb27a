use std::fmt;
use std::io;
use thiserror::Error;

/// Everything that can go wrong while opening, feeding or draining a stream.
///
/// Worker threads never panic or return these across thread boundaries
/// directly: a failure is wrapped in the block result for its sequence
/// number and raised on the thread that owns the stream handle.
#[derive(Error, Debug)]
pub enum PargzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bad compression level: {0}")]
    InvalidLevel(u32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("{0}")]
    Truncated(String),

    #[error("Corrupt gzip stream: {0}")]
    Corrupt(String),

    #[error("I/O operation on closed file")]
    Closed,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Thread error: {0}")]
    Thread(String),
}

impl PargzError {
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        PargzError::Config(msg.to_string())
    }

    pub fn compression<T: fmt::Display>(msg: T) -> Self {
        PargzError::Compression(msg.to_string())
    }

    pub fn overflow<T: fmt::Display>(msg: T) -> Self {
        PargzError::Overflow(msg.to_string())
    }

    pub fn corrupt<T: fmt::Display>(msg: T) -> Self {
        PargzError::Corrupt(msg.to_string())
    }

    pub fn unsupported<T: fmt::Display>(msg: T) -> Self {
        PargzError::Unsupported(msg.to_string())
    }

    pub fn thread<T: fmt::Display>(msg: T) -> Self {
        PargzError::Thread(msg.to_string())
    }

    /// The stream ended before the gzip end-of-stream marker or trailer.
    pub fn truncated() -> Self {
        PargzError::Truncated(
            "Compressed file ended before the end-of-stream marker was reached".to_string(),
        )
    }

    /// Recover the original error from an `io::Error` produced by one of
    /// the stream adapters; anything else stays an I/O error.
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<PargzError>()) {
            return PargzError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<PargzError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(inner)) => PargzError::Io(io::Error::new(kind, inner)),
            None => PargzError::Io(kind.into()),
        }
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            PargzError::Io(e) => e.kind(),
            PargzError::Truncated(_) => io::ErrorKind::UnexpectedEof,
            PargzError::Corrupt(_) => io::ErrorKind::InvalidData,
            PargzError::Config(_)
            | PargzError::InvalidLevel(_)
            | PargzError::Closed
            | PargzError::Unsupported(_) => io::ErrorKind::InvalidInput,
            PargzError::Compression(_) | PargzError::Overflow(_) | PargzError::Thread(_) => {
                io::ErrorKind::Other
            }
        }
    }
}

impl From<PargzError> for io::Error {
    fn from(err: PargzError) -> Self {
        match err {
            PargzError::Io(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}

pub type PargzResult<T> = Result<T, PargzError>;
