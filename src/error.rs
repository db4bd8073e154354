//! Error types for the stream receiver

use thiserror::Error;

use crate::protocol::MessageType;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Time filter error: {0}")]
    Filter(#[from] FilterInputError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a frame was aborted by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// Codec header announced a codec other than opus, flac or pcm
    UnsupportedCodec,
    /// Chunk memory could not provide a buffer
    OutOfMemory,
    /// A length field does not fit inside the frame
    MalformedLength,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::UnsupportedCodec => "unsupported codec",
            Self::OutOfMemory => "out of chunk memory",
            Self::MalformedLength => "malformed length",
        };
        f.write_str(text)
    }
}

/// Frame-level decode failure.
///
/// The decoder has already recovered when this is reported: the rest of
/// the frame is skipped and the next header parses normally.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} in {message_type:?} message")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message_type: MessageType,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message_type: MessageType) -> Self {
        Self { kind, message_type }
    }
}

/// Rejected time filter input; the filter state is left untouched
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterInputError {
    #[error("Non-monotonic sample time: {observed} after {last}")]
    NonMonotonicTime { last: i64, observed: i64 },
}

/// Byte source failures, propagated to the owner of the connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
