//! Timeshift buffering strategies.
//!
//! Every way of delivering a stream to the host implements
//! [`TimeshiftBuffer`]: open a URL, read, seek, pause, close. The host keeps
//! one active buffer at a time (see [`ActiveStream`]) and picks its
//! implementation through [`create_timeshift_buffer`], keyed on the kind of
//! stream and the configured [`StreamingMethod`].
//!
//! | Method | Buffer |
//! |---|---|
//! | `RealTime` | [`DirectBuffer`] reading the live URL |
//! | `Timeshift` | [`RingTimeshift`] over the block-window socket |
//! | `RollingFile` | [`RollingFile`] over rotated segment files |
//! | `ClientTimeshift` | [`ClientTimeshift`] over one growing file |
//! | `Transcoded` | [`TranscodeBuffer`] over a remote transcode |
//!
//! Recordings still being written use [`RecordingBuffer`]; finished ones and
//! radio always use [`DirectBuffer`].

pub mod circular;
pub mod client;
pub mod direct;
pub mod handle;
pub mod lease;
pub mod recording;
pub mod ring;
pub mod rolling;
pub mod seeker;
pub mod segments;
pub mod session;
pub mod slot;
pub mod transcode;
pub mod workers;

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use circular::CircularBuffer;
pub use client::ClientTimeshift;
pub use direct::DirectBuffer;
pub use recording::{RecordingBuffer, RecordingInfo};
pub use ring::RingTimeshift;
pub use rolling::RollingFile;
pub use seeker::Seeker;
pub use session::{SessionState, StreamState};
pub use slot::ActiveStream;
pub use transcode::TranscodeBuffer;

use crate::backend::{Backend, BackendError, HttpBackend};
use crate::config::{StreamingMethod, TimeshiftConfig};
use crate::network::{NetworkError, ProductionNetworkLayer};
use crate::transport::{BlockConnector, HttpTransport, MediaTransport, TcpConnector, TransportError};

/// Errors that fail `open`. Everything after a successful open degrades to
/// short reads or refused seeks instead.
#[derive(Debug, thiserror::Error)]
pub enum TimeshiftError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Stream did not buffer enough data within {waited_ms}ms")]
    PrebufferTimeout { waited_ms: u64 },

    #[error("Stream not ready: {reason}")]
    StreamNotReady { reason: String },

    #[error("Remote transcode failed for {stream}")]
    TranscodeFailed { stream: String },

    #[error("Buffer is already open")]
    AlreadyOpen,

    #[error("Block protocol error: {reason}")]
    Protocol { reason: String },
}

/// Result type for timeshift operations
pub type TimeshiftResult<T> = Result<T, TimeshiftError>;

/// Time window of a timeshifting stream as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimes {
    /// Wall-clock start of the seekable window, Unix seconds
    pub start_time: i64,
    /// Earliest seekable point relative to `start_time`, microseconds
    pub pts_begin: i64,
    /// Live edge relative to `start_time`, microseconds
    pub pts_end: i64,
}

impl StreamTimes {
    pub fn new(
        start: DateTime<Utc>,
        server_offset_secs: i64,
        begin: std::time::Duration,
        end: std::time::Duration,
    ) -> Self {
        Self {
            start_time: start.timestamp() + server_offset_secs,
            pts_begin: begin.as_micros() as i64,
            pts_end: end.as_micros() as i64,
        }
    }
}

/// The stream contract the host plays through.
///
/// All methods take `&self`; `close` may be called from any task while a
/// `read` or `seek` is blocked and wakes it.
#[async_trait]
pub trait TimeshiftBuffer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Connects and prebuffers.
    ///
    /// # Errors
    ///
    /// - `TimeshiftError::Transport` - Connection failed or remote not found
    /// - `TimeshiftError::Backend` - Control request rejected
    /// - `TimeshiftError::PrebufferTimeout` - Not enough data arrived in time
    /// - `TimeshiftError::StreamNotReady` - Remote stream finished without data
    async fn open(&self, url: &str) -> TimeshiftResult<()>;

    /// Copies up to `buf.len()` bytes. Zero means no data right now; with
    /// [`is_complete`](Self::is_complete) it means end of stream.
    async fn read(&self, buf: &mut [u8]) -> usize;

    /// Repositions the stream. `None` leaves the position unchanged.
    async fn seek(&self, position: SeekFrom) -> Option<u64>;

    /// Stops workers and releases remote resources. Idempotent.
    async fn close(&self);

    fn position(&self) -> u64;

    fn length(&self) -> u64;

    fn can_pause_stream(&self) -> bool;

    async fn pause_stream(&self, paused: bool);

    fn can_seek_stream(&self) -> bool;

    fn is_real_time_stream(&self) -> bool;

    fn stream_times(&self) -> Option<StreamTimes>;

    /// Preferred host read size.
    fn read_chunk_size(&self) -> usize;

    fn state(&self) -> StreamState;

    /// No more data will be appended remotely.
    fn is_complete(&self) -> bool;
}

/// Absolute target of `position` against the current offset and length.
///
/// `None` when the target would be negative or overflow.
pub fn resolve_seek(position: SeekFrom, current: u64, length: u64) -> Option<u64> {
    match position {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => length.checked_add_signed(delta),
    }
}

/// Dependencies handed to every buffer constructor.
#[derive(Clone)]
pub struct StreamContext {
    pub config: Arc<TimeshiftConfig>,
    pub backend: Arc<dyn Backend>,
    pub transport: Arc<dyn MediaTransport>,
    pub connector: Arc<dyn BlockConnector>,
}

impl StreamContext {
    pub fn new(
        config: TimeshiftConfig,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn MediaTransport>,
        connector: Arc<dyn BlockConnector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            transport,
            connector,
        }
    }

    /// Context talking to a real backend over HTTP and TCP.
    ///
    /// # Errors
    ///
    /// - `NetworkError::Client` - HTTP client could not be built
    pub fn production(config: TimeshiftConfig) -> Result<Self, ContextError> {
        let network = Arc::new(ProductionNetworkLayer::new(&config.backend)?);
        let backend = Arc::new(HttpBackend::new(&config.backend, network));
        let transport = Arc::new(HttpTransport::new(&config.backend)?);
        let connector = Arc::new(TcpConnector::new(
            &config.backend.host,
            config.ring.port,
            config.ring.connect_timeout,
        ));
        Ok(Self::new(config, backend, transport, connector))
    }
}

/// Errors building a production [`StreamContext`].
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What the host asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    LiveTv,
    Radio,
    Recording(RecordingInfo),
}

/// Builds the buffer for `kind` under the configured streaming method.
pub fn create_timeshift_buffer(
    kind: &StreamKind,
    context: &StreamContext,
) -> Box<dyn TimeshiftBuffer> {
    match kind {
        StreamKind::Radio => Box::new(DirectBuffer::live(context.clone())),
        StreamKind::Recording(info) if info.is_live_at(Utc::now()) => {
            Box::new(RecordingBuffer::new(context.clone(), info.clone()))
        }
        StreamKind::Recording(_) => Box::new(DirectBuffer::recording(context.clone())),
        StreamKind::LiveTv => match context.config.streaming.method {
            StreamingMethod::RealTime => Box::new(DirectBuffer::live(context.clone())),
            StreamingMethod::Timeshift => Box::new(RingTimeshift::new(context.clone())),
            StreamingMethod::RollingFile => Box::new(RollingFile::new(context.clone())),
            StreamingMethod::ClientTimeshift => Box::new(ClientTimeshift::new(context.clone())),
            StreamingMethod::Transcoded => Box::new(TranscodeBuffer::new(context.clone())),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulation::SimulatedDvr;

    #[test]
    fn test_resolve_seek() {
        assert_eq!(resolve_seek(SeekFrom::Start(10), 50, 100), Some(10));
        assert_eq!(resolve_seek(SeekFrom::Current(-20), 50, 100), Some(30));
        assert_eq!(resolve_seek(SeekFrom::Current(-60), 50, 100), None);
        assert_eq!(resolve_seek(SeekFrom::End(-1), 50, 100), Some(99));
        assert_eq!(resolve_seek(SeekFrom::End(5), 50, 100), Some(105));
    }

    #[test]
    fn test_stream_times_apply_server_offset() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        let times = StreamTimes::new(start, -30, Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(times.start_time, 1_699_999_970);
        assert_eq!(times.pts_begin, 2_000_000);
        assert_eq!(times.pts_end, 5_000_000);
    }

    #[test]
    fn test_factory_selects_by_method() {
        let dvr = SimulatedDvr::new();
        let expectations = [
            (StreamingMethod::RealTime, "direct"),
            (StreamingMethod::Timeshift, "ring"),
            (StreamingMethod::RollingFile, "rolling"),
            (StreamingMethod::ClientTimeshift, "client"),
            (StreamingMethod::Transcoded, "transcode"),
        ];

        for (method, name) in expectations {
            let mut config = TimeshiftConfig::for_testing();
            config.streaming.method = method;
            let context = dvr.context(config);
            assert_eq!(create_timeshift_buffer(&StreamKind::LiveTv, &context).name(), name);
            assert_eq!(create_timeshift_buffer(&StreamKind::Radio, &context).name(), "direct");
        }
    }

    #[test]
    fn test_factory_selects_recording_buffer_while_live() {
        let dvr = SimulatedDvr::new();
        let context = dvr.context(TimeshiftConfig::for_testing());

        let hour = Duration::from_secs(3600);
        let live = RecordingInfo::new(Utc::now() - chrono::Duration::minutes(5), hour);
        let finished = RecordingInfo::new(Utc::now() - chrono::Duration::hours(3), hour);

        assert_eq!(
            create_timeshift_buffer(&StreamKind::Recording(live), &context).name(),
            "recording"
        );
        assert_eq!(
            create_timeshift_buffer(&StreamKind::Recording(finished), &context).name(),
            "direct"
        );
    }
}
