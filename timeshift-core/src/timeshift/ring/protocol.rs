//! Wire format of the block-window protocol.
//!
//! After connecting, the client sends one open line naming the stream. From
//! then on it writes fixed-size NUL-padded block requests
//! `Range: bytes=<start>-<end>-<seq>` and the server answers each one, in
//! order, with a fixed-size header `<offset>:<size> <total> <reserved>`
//! followed by `size` payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of one encoded block request.
pub const REQUEST_LEN: usize = 64;

/// Size of one encoded response header.
pub const HEADER_LEN: usize = 32;

/// Errors decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed block header: {header:?}")]
    MalformedHeader { header: String },

    #[error("Malformed block request: {request:?}")]
    MalformedRequest { request: String },

    #[error("Malformed open line: {line:?}")]
    MalformedOpen { line: String },
}

/// Request for `length` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub offset: u64,
    pub length: u64,
    pub sequence: u64,
}

impl BlockRequest {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let text = format!(
            "Range: bytes={}-{}-{}",
            self.offset,
            self.offset + self.length,
            self.sequence
        );
        pad(&text)
    }

    pub fn decode(frame: &[u8; REQUEST_LEN]) -> Result<Self, ProtocolError> {
        let text = unpad(frame);
        let malformed = || ProtocolError::MalformedRequest {
            request: text.to_string(),
        };

        let range = text.strip_prefix("Range: bytes=").ok_or_else(malformed)?;
        let mut parts = range.splitn(3, '-');
        let start = parse_field(parts.next()).ok_or_else(malformed)?;
        let end = parse_field(parts.next()).ok_or_else(malformed)?;
        let sequence = parse_field(parts.next()).ok_or_else(malformed)?;
        if end < start {
            return Err(malformed());
        }

        Ok(Self {
            offset: start,
            length: end - start,
            sequence,
        })
    }
}

/// Response header preceding a block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Logical offset of the payload's first byte
    pub offset: u64,
    /// Payload bytes following the header; zero when no data exists there
    pub size: u64,
    /// Total stream length known to the server
    pub total: u64,
    pub reserved: u64,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let text = format!("{}:{} {} {}", self.offset, self.size, self.total, self.reserved);
        pad(&text)
    }

    pub fn decode(frame: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let text = unpad(frame);
        let malformed = || ProtocolError::MalformedHeader {
            header: text.to_string(),
        };

        let (offset, rest) = text.split_once(':').ok_or_else(malformed)?;
        let mut fields = rest.split_whitespace();
        let header = Self {
            offset: parse_field(Some(offset)).ok_or_else(malformed)?,
            size: parse_field(fields.next()).ok_or_else(malformed)?,
            total: parse_field(fields.next()).ok_or_else(malformed)?,
            reserved: parse_field(fields.next()).unwrap_or(0),
        };
        Ok(header)
    }
}

/// Open line sent once after connecting.
pub fn encode_open(stream: &str, client_id: &str, session_id: &str) -> Vec<u8> {
    format!("GET /{stream} TSB/1.0\r\nClient: {client_id}\r\nSid: {session_id}\r\n\r\n")
        .into_bytes()
}

/// Extracts the stream name from an open line.
pub fn decode_open(line: &str) -> Result<String, ProtocolError> {
    line.lines()
        .next()
        .and_then(|first| first.strip_prefix("GET /"))
        .and_then(|rest| rest.strip_suffix(" TSB/1.0"))
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MalformedOpen {
            line: line.to_string(),
        })
}

/// Reads one response header, or `None` on a clean end of stream.
///
/// # Errors
///
/// - `io::ErrorKind::InvalidData` - Header text does not parse
/// - `io::Error` - Socket failed or closed mid-header
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<BlockHeader>> {
    let mut frame = [0u8; HEADER_LEN];
    let first = reader.read(&mut frame).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut frame[first..]).await?;
    BlockHeader::decode(&frame)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn pad<const N: usize>(text: &str) -> [u8; N] {
    let mut frame = [0u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    frame[..len].copy_from_slice(&bytes[..len]);
    frame
}

fn unpad(frame: &[u8]) -> &str {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    std::str::from_utf8(&frame[..end]).unwrap_or("").trim()
}

fn parse_field(field: Option<&str>) -> Option<u64> {
    field?.trim().parse().ok()
}
