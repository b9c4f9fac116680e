//! Byte transports the buffering strategies read from.
//!
//! [`MediaTransport`] opens a remote stream URL at a byte offset and hands back
//! a [`MediaReader`]; closing is dropping the reader. [`BlockConnector`] opens
//! the raw full-duplex socket used by the block-window protocol.

pub mod http;
pub mod socket;

use async_trait::async_trait;
pub use http::HttpTransport;
pub use socket::{BlockConnector, BlockSocket, BoxedSocket, TcpConnector};

/// Errors raised while opening or reading a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Connection to {target} timed out")]
    Timeout { target: String },

    #[error("Resource not found: {url}")]
    NotFound { url: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Transport does not support seeking")]
    NotSeekable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// An open remote stream.
#[async_trait]
pub trait MediaReader: Send {
    /// Reads up to `buf.len()` bytes. Zero means no data right now, which at
    /// the end of a finished resource is end of file.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` / `TransportError::Http` - Connection broke mid-read
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Repositions to an absolute offset and returns it.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotSeekable` - Resource cannot be reopened at an offset
    /// - `TransportError` - Reopening failed
    async fn seek(&mut self, position: u64) -> TransportResult<u64>;

    /// Total resource length when the remote side reports one.
    fn length(&self) -> Option<u64>;

    /// Offset of the next byte `read` returns.
    fn position(&self) -> u64;

    /// Whether `seek` can succeed.
    fn is_seekable(&self) -> bool;
}

/// Opens remote stream URLs.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Opens `url` positioned at `offset`.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotFound` - Remote side does not know the resource
    /// - `TransportError::Connect` / `TransportError::Timeout` - Backend unreachable
    async fn open(&self, url: &str, offset: u64) -> TransportResult<Box<dyn MediaReader>>;
}
