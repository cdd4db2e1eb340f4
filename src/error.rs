use std::fmt;
use std::io;

use coap_lite::error::MessageError;

/// Reasons a datagram could not be decoded into a [`Message`](crate::Message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// Fewer than four bytes, so not even a header.
    InvalidHeader,
    InvalidVersion(u8),
    /// A token longer than eight bytes, or one running past the datagram.
    InvalidTokenLength,
    InvalidOptionDelta,
    InvalidOptionLength,
    /// A payload marker was present but nothing followed it.
    EmptyPayload,
    /// A 0.00 message carried a token, options or a payload.
    InvalidEmptyMessage,
    UnknownCriticalOption(u16),
    InvalidBlockValue,
    /// The message could not be serialized.
    InvalidPacketLength,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::InvalidHeader => write!(f, "Invalid header"),
            FormatError::InvalidVersion(v) => write!(f, "Invalid version {}", v),
            FormatError::InvalidTokenLength => write!(f, "Invalid token length"),
            FormatError::InvalidOptionDelta => write!(f, "Invalid option delta"),
            FormatError::InvalidOptionLength => write!(f, "Invalid option length"),
            FormatError::EmptyPayload => write!(f, "Payload marker without payload"),
            FormatError::InvalidEmptyMessage => write!(f, "Empty message with content"),
            FormatError::UnknownCriticalOption(n) => write!(f, "Unknown critical option {}", n),
            FormatError::InvalidBlockValue => write!(f, "Invalid block option value"),
            FormatError::InvalidPacketLength => write!(f, "Invalid packet length"),
        }
    }
}

impl std::error::Error for FormatError {}

impl From<MessageError> for FormatError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::InvalidHeader => FormatError::InvalidHeader,
            MessageError::InvalidPacketLength => FormatError::InvalidPacketLength,
            MessageError::InvalidTokenLength => FormatError::InvalidTokenLength,
            MessageError::InvalidOptionDelta => FormatError::InvalidOptionDelta,
            MessageError::InvalidOptionLength => FormatError::InvalidOptionLength,
        }
    }
}

#[derive(Debug)]
pub enum CoapError {
    Format(FormatError),
    /// The token is already open toward this peer.
    DuplicateExchange,
    NoMessageIdAvailable,
    TokenExhausted,
    TransmissionTimeout,
    /// The peer answered with a Reset.
    Reset,
    Cancelled,
    BlockSequence { expected: u32, received: u32 },
    /// The peer tried to enlarge the block size in the middle of a transfer.
    BlockSizeGrowth { current: usize, requested: usize },
    BodyTooLarge(usize),
    InvalidRequest(&'static str),
    Shutdown,
    Io(io::Error),
}

impl fmt::Display for CoapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoapError::Format(e) => write!(f, "Format error: {}", e),
            CoapError::DuplicateExchange => write!(f, "Token already in use for this peer"),
            CoapError::NoMessageIdAvailable => write!(f, "No message id available"),
            CoapError::TokenExhausted => write!(f, "Could not draw an unused token"),
            CoapError::TransmissionTimeout => write!(f, "Transmission timed out"),
            CoapError::Reset => write!(f, "Reset by peer"),
            CoapError::Cancelled => write!(f, "Exchange cancelled"),
            CoapError::BlockSequence { expected, received } => write!(
                f,
                "Out of sequence block: expected {}, received {}",
                expected, received
            ),
            CoapError::BlockSizeGrowth { current, requested } => write!(
                f,
                "Block size may not grow from {} to {}",
                current, requested
            ),
            CoapError::BodyTooLarge(size) => write!(f, "Body of {} bytes is too large", size),
            CoapError::InvalidRequest(reason) => write!(f, "Invalid request: {}", reason),
            CoapError::Shutdown => write!(f, "Endpoint shut down"),
            CoapError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CoapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoapError::Format(e) => Some(e),
            CoapError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FormatError> for CoapError {
    fn from(e: FormatError) -> Self {
        CoapError::Format(e)
    }
}

impl From<io::Error> for CoapError {
    fn from(e: io::Error) -> Self {
        CoapError::Io(e)
    }
}

impl From<CoapError> for io::Error {
    fn from(e: CoapError) -> Self {
        match e {
            CoapError::Io(e) => e,
            CoapError::Format(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CoapError::TransmissionTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, "transmission timed out")
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoapError>;
