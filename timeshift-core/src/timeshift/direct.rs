//! Pass-through buffer: reads go straight to one transport reader.

use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handle::{ReaderSlot, SlotRead};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct DirectInner {
    state: StreamState,
    position: u64,
    length: Option<u64>,
    seekable: bool,
}

/// Live radio, real-time TV and finished recordings.
pub struct DirectBuffer {
    context: StreamContext,
    live: bool,
    workers: WorkerSet,
    reader: ReaderSlot,
    inner: Mutex<DirectInner>,
}

impl DirectBuffer {
    /// Buffer for a live stream: not pausable, reported as real time.
    pub fn live(context: StreamContext) -> Self {
        Self::new(context, true)
    }

    /// Buffer for a finished recording.
    pub fn recording(context: StreamContext) -> Self {
        Self::new(context, false)
    }

    fn new(context: StreamContext, live: bool) -> Self {
        Self {
            context,
            live,
            workers: WorkerSet::new("direct"),
            reader: ReaderSlot::new(),
            inner: Mutex::new(DirectInner::default()),
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for DirectBuffer {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            *inner = DirectInner {
                state: StreamState::Opening,
                ..Default::default()
            };
        }
        self.workers.rearm();

        let reader = match self.context.transport.open(url, 0).await {
            Ok(reader) => reader,
            Err(e) => {
                self.inner.lock().state = StreamState::Closed;
                return Err(e.into());
            }
        };
        let (length, seekable) = (reader.length(), reader.is_seekable());
        self.reader.replace(reader).await;

        let mut inner = self.inner.lock();
        inner.length = length;
        inner.seekable = seekable;
        inner.state = StreamState::Active;
        info!("Opened direct stream {} (length {:?}, seekable {})", url, length, seekable);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> usize {
        if !self.inner.lock().state.is_open() {
            return 0;
        }

        let mut shutdown = self.workers.subscribe();
        match self.reader.read(buf, &mut shutdown).await {
            SlotRead::Data(count) => {
                let mut inner = self.inner.lock();
                inner.position += count as u64;
                if let Some(length) = inner.length
                    && inner.position > length
                {
                    inner.length = Some(inner.position);
                }
                count
            }
            SlotRead::Failed(e) => {
                warn!("Direct stream read failed: {}", e);
                0
            }
            SlotRead::Empty | SlotRead::Closed => 0,
        }
    }

    async fn seek(&self, position: SeekFrom) -> Option<u64> {
        let target = {
            let inner = self.inner.lock();
            if !inner.state.is_open() || !inner.seekable {
                return None;
            }
            let length = inner.length.unwrap_or(inner.position);
            resolve_seek(position, inner.position, length)?.min(length)
        };

        match self.reader.seek(target).await? {
            Ok(actual) => {
                self.inner.lock().position = actual;
                debug!("Direct stream seeked to {}", actual);
                Some(actual)
            }
            Err(e) => {
                warn!("Direct stream seek to {} failed: {}", target, e);
                None
            }
        }
    }

    async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Closed {
                return;
            }
            inner.state = StreamState::Closing;
        }
        self.workers.stop(CLOSE_TIMEOUT).await;
        self.reader.clear().await;
        self.inner.lock().state = StreamState::Closed;
        debug!("Closed direct stream");
    }

    fn position(&self) -> u64 {
        self.inner.lock().position
    }

    fn length(&self) -> u64 {
        let inner = self.inner.lock();
        inner.length.unwrap_or(inner.position)
    }

    fn can_pause_stream(&self) -> bool {
        !self.live
    }

    async fn pause_stream(&self, paused: bool) {
        if self.live {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state.is_open() {
            inner.state = if paused {
                StreamState::Paused
            } else {
                StreamState::Active
            };
        }
    }

    fn can_seek_stream(&self) -> bool {
        self.inner.lock().seekable
    }

    fn is_real_time_stream(&self) -> bool {
        self.live
    }

    fn stream_times(&self) -> Option<StreamTimes> {
        None
    }

    fn read_chunk_size(&self) -> usize {
        if self.live {
            self.context.config.streaming.live_chunk_size
        } else {
            self.context.config.streaming.recording_chunk_size
        }
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn is_complete(&self) -> bool {
        !self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeshiftConfig;
    use crate::simulation::SimulatedDvr;

    #[tokio::test(start_paused = true)]
    async fn test_recording_reads_and_seeks() {
        let dvr = SimulatedDvr::new();
        dvr.add_file("recording/42", 100_000);
        let buffer = DirectBuffer::recording(dvr.context(TimeshiftConfig::for_testing()));

        buffer.open("sim://recording/42").await.unwrap();
        assert_eq!(buffer.length(), 100_000);
        assert!(buffer.can_seek_stream());

        assert_eq!(buffer.seek(SeekFrom::Start(50_000)).await, Some(50_000));
        let mut buf = [0u8; 512];
        let read = buffer.read(&mut buf).await;
        assert!(read > 0);
        assert!(SimulatedDvr::verify_pattern(50_000, &buf[..read]));
        assert_eq!(buffer.position(), 50_000 + read as u64);

        assert_eq!(buffer.seek(SeekFrom::End(1_000)).await, Some(100_000));
        buffer.close().await;
        assert_eq!(buffer.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stream_refuses_pause() {
        let dvr = SimulatedDvr::new();
        let buffer = DirectBuffer::live(dvr.context(TimeshiftConfig::for_testing()));
        buffer.open("sim://live/7").await.unwrap();

        assert!(!buffer.can_pause_stream());
        assert!(buffer.is_real_time_stream());
        assert!(buffer.stream_times().is_none());
        buffer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_url_fails_open() {
        let dvr = SimulatedDvr::new();
        let buffer = DirectBuffer::recording(dvr.context(TimeshiftConfig::for_testing()));
        assert!(matches!(
            buffer.open("sim://recording/missing").await,
            Err(TimeshiftError::Transport(_))
        ));
        assert_eq!(buffer.state(), StreamState::Closed);
        assert_eq!(buffer.read(&mut [0u8; 16]).await, 0);
    }
}
