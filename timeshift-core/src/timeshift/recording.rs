//! Playback of a recording that is still being written.

use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handle::{ReaderSlot, SlotRead};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Reopen attempts at the end of data before reporting no data.
const MAX_REOPEN_ATTEMPTS: u32 = 5;
const REOPEN_DELAY: Duration = Duration::from_millis(400);

/// Schedule of one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    pub start: DateTime<Utc>,
    /// Scheduled duration
    pub duration: Duration,
}

impl RecordingInfo {
    pub fn new(start: DateTime<Utc>, duration: Duration) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.duration).unwrap_or_default()
    }

    /// Whether the recorder is still writing at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.start && now < self.end()
    }

    /// Recorded so far while live; zero once finished.
    pub fn duration_at(&self, now: DateTime<Utc>) -> Duration {
        if !self.is_live_at(now) {
            return Duration::ZERO;
        }
        (now - self.start).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct RecordingInner {
    state: StreamState,
    url: String,
    position: u64,
    length: u64,
    seekable: bool,
}

/// In-progress recording whose file grows while it plays.
///
/// Reaching the end of the file while the recording is live reopens it at
/// the same position until new data shows up or the retries run out.
pub struct RecordingBuffer {
    context: StreamContext,
    info: RecordingInfo,
    workers: WorkerSet,
    reader: ReaderSlot,
    inner: Mutex<RecordingInner>,
}

impl RecordingBuffer {
    pub fn new(context: StreamContext, info: RecordingInfo) -> Self {
        Self {
            context,
            info,
            workers: WorkerSet::new("recording"),
            reader: ReaderSlot::new(),
            inner: Mutex::new(RecordingInner::default()),
        }
    }

    pub fn info(&self) -> &RecordingInfo {
        &self.info
    }

    /// Recorded duration so far, zero once the recording finished.
    pub fn duration(&self) -> Duration {
        self.info.duration_at(Utc::now())
    }

    async fn reopen_at(&self, url: &str, position: u64) -> bool {
        self.reader.clear().await;
        match self.context.transport.open(url, position).await {
            Ok(reader) => {
                let (length, seekable) = (reader.length(), reader.is_seekable());
                self.reader.replace(reader).await;
                let mut inner = self.inner.lock();
                if let Some(length) = length {
                    inner.length = inner.length.max(length);
                }
                inner.seekable = seekable;
                true
            }
            Err(e) => {
                debug!("Reopen of {} at {} failed: {}", url, position, e);
                false
            }
        }
    }

    async fn read_once(&self, buf: &mut [u8]) -> Option<usize> {
        let mut shutdown = self.workers.subscribe();
        match self.reader.read(buf, &mut shutdown).await {
            SlotRead::Data(count) => Some(count),
            SlotRead::Empty => Some(0),
            SlotRead::Failed(e) => {
                warn!("Recording read failed: {}", e);
                Some(0)
            }
            SlotRead::Closed => None,
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for RecordingBuffer {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            *inner = RecordingInner {
                state: StreamState::Opening,
                url: url.to_string(),
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
        inner.length = length.unwrap_or(0);
        inner.seekable = seekable;
        inner.state = StreamState::Active;
        info!(
            "Opened in-progress recording {} ({} bytes so far)",
            url, inner.length
        );
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> usize {
        let url = {
            let inner = self.inner.lock();
            if !inner.state.is_open() {
                return 0;
            }
            inner.url.clone()
        };

        let mut attempts = 0;
        loop {
            let Some(count) = self.read_once(buf).await else {
                return 0;
            };
            if count > 0 {
                let mut inner = self.inner.lock();
                inner.position += count as u64;
                inner.length = inner.length.max(inner.position);
                return count;
            }

            if !self.info.is_live_at(Utc::now()) || attempts >= MAX_REOPEN_ATTEMPTS {
                return 0;
            }
            attempts += 1;
            tokio::time::sleep(REOPEN_DELAY).await;
            if self.workers.is_stopping() {
                return 0;
            }
            let position = self.inner.lock().position;
            debug!(
                "End of recording data at {}, reopening (attempt {})",
                position, attempts
            );
            self.reopen_at(&url, position).await;
        }
    }

    async fn seek(&self, position: SeekFrom) -> Option<u64> {
        let (target, url) = {
            let inner = self.inner.lock();
            if !inner.state.is_open() || !inner.seekable {
                return None;
            }
            let target = resolve_seek(position, inner.position, inner.length)?.min(inner.length);
            (target, inner.url.clone())
        };

        let landed = match self.reader.seek(target).await {
            Some(Ok(actual)) => Some(actual),
            Some(Err(e)) => {
                warn!("Recording seek to {} failed: {}", target, e);
                None
            }
            None => self.reopen_at(&url, target).await.then_some(target),
        }?;
        self.inner.lock().position = landed;
        Some(landed)
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
        debug!("Closed in-progress recording");
    }

    fn position(&self) -> u64 {
        self.inner.lock().position
    }

    fn length(&self) -> u64 {
        self.inner.lock().length
    }

    fn can_pause_stream(&self) -> bool {
        true
    }

    async fn pause_stream(&self, paused: bool) {
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
        false
    }

    fn stream_times(&self) -> Option<StreamTimes> {
        let now = Utc::now();
        if !self.inner.lock().state.is_open() || !self.info.is_live_at(now) {
            return None;
        }
        Some(StreamTimes::new(
            self.info.start,
            self.context.config.backend.server_time_offset_secs,
            Duration::ZERO,
            self.info.duration_at(now),
        ))
    }

    fn read_chunk_size(&self) -> usize {
        self.context.config.streaming.recording_chunk_size
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn is_complete(&self) -> bool {
        !self.info.is_live_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_tracks_elapsed_while_live() {
        let start = Utc::now() - chrono::Duration::minutes(10);
        let info = RecordingInfo::new(start, Duration::from_secs(3600));
        let now = start + chrono::Duration::minutes(10);
        assert!(info.is_live_at(now));
        assert_eq!(info.duration_at(now), Duration::from_secs(600));
    }

    #[test]
    fn test_duration_is_zero_once_finished() {
        let start = Utc::now() - chrono::Duration::hours(2);
        let info = RecordingInfo::new(start, Duration::from_secs(3600));
        assert!(!info.is_live_at(Utc::now()));
        assert_eq!(info.duration_at(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn test_not_live_before_start() {
        let start = Utc::now() + chrono::Duration::minutes(5);
        let info = RecordingInfo::new(start, Duration::from_secs(3600));
        assert!(!info.is_live_at(Utc::now()));
    }
}
