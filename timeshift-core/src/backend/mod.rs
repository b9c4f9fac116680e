//! Remote DVR backend control plane.
//!
//! The buffering strategies only need a handful of control calls from the
//! backend: stream metadata (length, duration, completion, rotated segment
//! files), stream and transcode session lifecycle, and lease keep-alives.
//! [`Backend`] is that seam; [`HttpBackend`] speaks the backend's service
//! API and [`crate::simulation::SimulatedBackend`] stands in for it in tests.

pub mod client;
pub mod response;

use std::time::Duration;

use async_trait::async_trait;
pub use client::HttpBackend;

use crate::network::NetworkError;

/// Errors from control-plane requests.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Backend returned HTTP {status} for {method}")]
    Http { method: String, status: u16 },

    #[error("Backend rejected {method}: {message}")]
    Rejected { method: String, message: String },

    #[error("Malformed {method} response: {reason}")]
    Malformed { method: String, reason: String },

    #[error("Stream not found: {stream}")]
    NotFound { stream: String },
}

impl BackendError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_) | BackendError::Malformed { .. } | BackendError::Http { .. }
        )
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// One rotated file as reported by the backend, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Backend-side file name
    pub filename: String,
    /// Offset of the file's first byte within the logical stream
    pub offset: u64,
}

impl SegmentRecord {
    pub fn new(filename: impl Into<String>, offset: u64) -> Self {
        Self {
            filename: filename.into(),
            offset,
        }
    }
}

/// Current state of a remote stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    /// Total bytes written by the backend so far
    pub length: u64,
    /// Recorded duration so far
    pub duration: Duration,
    /// No more data will be appended
    pub complete: bool,
    /// Rotated segment files, oldest first (rolling-file streams only)
    pub segments: Vec<SegmentRecord>,
}

/// Progress of a remote transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeStatus {
    /// Percentage of the initial transcode buffer filled
    Preparing(u8),
    /// Playable URL is ready
    Ready,
    /// Backend gave up
    Failed,
}

/// What a lease keeps alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    /// Live stream session (paused timeshift, rolling files)
    Stream,
    /// Transcoding session
    Transcode,
}

impl LeaseKind {
    pub(crate) fn method(self) -> &'static str {
        match self {
            LeaseKind::Stream => "channel.stream.lease",
            LeaseKind::Transcode => "channel.transcode.lease",
        }
    }
}

/// Backend features decided once per stream at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Rolling files rotate on EPG programme boundaries rather than a fixed interval
    pub epg_rollover: bool,
    /// Stream URLs accept ranged reopening
    pub ranged_streams: bool,
}

/// Control-plane calls the buffering strategies depend on.
///
/// Every call is keyed by the stream URL the strategy was opened with.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reports backend features relevant to buffering.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn capabilities(&self) -> BackendResult<Capabilities>;

    /// Asks the backend to start recording the live stream into its buffer.
    ///
    /// # Errors
    ///
    /// - `BackendError::NotFound` - Unknown channel or stream
    /// - `BackendError` - Request failed or was rejected
    async fn start_stream(&self, stream: &str) -> BackendResult<()>;

    /// Releases the backend's stream session.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn stop_stream(&self, stream: &str) -> BackendResult<()>;

    /// Polls the current length, duration, completion flag and segments.
    ///
    /// # Errors
    ///
    /// - `BackendError::Malformed` - Response could not be interpreted
    /// - `BackendError` - Request failed or was rejected
    async fn stream_info(&self, stream: &str) -> BackendResult<StreamInfo>;

    /// URL serving one rotated segment file.
    fn segment_url(&self, stream: &str, filename: &str) -> String;

    /// Starts a remote transcode of the stream.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn start_transcode(&self, stream: &str, profile: &str) -> BackendResult<()>;

    /// Polls transcode preparation progress.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn transcode_status(&self, stream: &str) -> BackendResult<TranscodeStatus>;

    /// URL the host plays once the transcode is ready.
    fn transcode_url(&self, stream: &str) -> String;

    /// Stops the remote transcode.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn stop_transcode(&self, stream: &str) -> BackendResult<()>;

    /// Keep-alive ping preventing the backend from reaping the session.
    ///
    /// # Errors
    ///
    /// - `BackendError` - Request failed or was rejected
    async fn lease(&self, stream: &str, kind: LeaseKind) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let malformed = BackendError::Malformed {
            method: "channel.stream.info".to_string(),
            reason: "missing length".to_string(),
        };
        assert!(malformed.is_transient());

        let rejected = BackendError::Rejected {
            method: "channel.stream.start".to_string(),
            message: "no tuner".to_string(),
        };
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_lease_methods() {
        assert_eq!(LeaseKind::Stream.method(), "channel.stream.lease");
        assert_eq!(LeaseKind::Transcode.method(), "channel.transcode.lease");
    }
}
