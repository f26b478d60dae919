use std::{
    str::Utf8Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Connection(ConnectionError),
    Protocol(ProtocolError),
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {e}"),
            Error::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

/// Structural failures found while encoding or decoding a frame.
///
/// Per-partition broker error codes are never reported through this type, they are
/// part of the decoded response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame declares {declared} bytes but {actual} bytes follow the length prefix")]
    FrameLength { declared: i32, actual: usize },
    #[error("correlation id mismatch, expected {expected} but got {actual}")]
    CorrelationMismatch { expected: i32, actual: i32 },
    #[error("unexpected end of buffer while reading {field}")]
    UnexpectedEof { field: &'static str },
    #[error("negative length {length} for {field}")]
    NegativeLength { field: &'static str, length: i32 },
    #[error("invalid utf-8 string: {0}")]
    InvalidString(#[from] Utf8Error),
    #[error("{0} unread bytes after the end of the response")]
    TrailingBytes(usize),
    #[error("unsupported message magic byte {0}")]
    UnsupportedMagic(i8),
    #[error("compressed message with codec {0} is not supported")]
    UnsupportedCompression(i8),
    #[error("{0} bytes do not fit an int16 string length")]
    StringTooLong(usize),
    #[error("{0} elements do not fit an int32 array length")]
    ArrayTooLong(usize),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    pub(crate) fn encode<E: std::fmt::Display>(err: E) -> Self {
        ProtocolError::Encode(err.to_string())
    }

    pub(crate) fn decode<E: std::fmt::Display>(err: E) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Disconnected,
    Unexpected(String),
    Protocol(ProtocolError),
    SocketAddr(String),
    UnexpectedResponse(String),
    Canceled,
    Shutdown,
    Timeout,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "{e}"),
            ConnectionError::Disconnected => write!(f, "Disconnected"),
            ConnectionError::Unexpected(e) => write!(f, "{e}"),
            ConnectionError::Protocol(e) => write!(f, "Error decoding frame: {e}"),
            ConnectionError::SocketAddr(e) => write!(f, "Error obtaining socket address: {e}"),
            ConnectionError::UnexpectedResponse(e) => {
                write!(f, "Unexpected response from kafka: {e}")
            }
            ConnectionError::Canceled => write!(f, "Canceled request"),
            ConnectionError::Shutdown => write!(f, "The connection was shut down"),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Sticky error flag shared between a connection's sender and its background tasks.
#[derive(Clone)]
pub struct SharedError {
    error_set: Arc<AtomicBool>,
    error: Arc<Mutex<Option<ConnectionError>>>,
}

impl SharedError {
    pub fn new() -> SharedError {
        SharedError {
            error_set: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_set(&self) -> bool {
        self.error_set.load(Ordering::Acquire)
    }

    pub fn remove(&self) -> Option<ConnectionError> {
        let error = match self.error.lock() {
            Ok(mut lock) => lock.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.error_set.store(false, Ordering::Release);
        error
    }

    pub fn set(&self, error: ConnectionError) {
        match self.error.lock() {
            Ok(mut lock) => *lock = Some(error),
            Err(poisoned) => *poisoned.into_inner() = Some(error),
        }
        self.error_set.store(true, Ordering::Release);
    }
}

impl Default for SharedError {
    fn default() -> Self {
        Self::new()
    }
}
