//! Playback of a remote transcoding session.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handle::{ReaderSlot, SlotRead};
use super::lease::{LeaseSchedule, LeaseTarget, run_lease_worker};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};
use crate::backend::{Backend, LeaseKind, TranscodeStatus};

/// Status polls before giving up on a transcode that never becomes ready.
const MAX_STATUS_POLLS: u32 = 30;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Bound on joining the lease worker at close.
const LEASE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct TranscodeInner {
    state: StreamState,
    stream: String,
    playable_url: Option<String>,
    position: u64,
    length: Option<u64>,
    seekable: bool,
}

struct TranscodeLease {
    stream: String,
    backend: Arc<dyn Backend>,
    refresh_interval: Duration,
}

#[async_trait]
impl LeaseTarget for TranscodeLease {
    async fn renew_lease(&self) -> bool {
        match self.backend.lease(&self.stream, LeaseKind::Transcode).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Transcode lease for {} failed: {}", self.stream, e);
                false
            }
        }
    }

    async fn refresh(&self) -> Duration {
        self.refresh_interval
    }
}

/// Remote transcode kept alive by leases.
pub struct TranscodeBuffer {
    context: StreamContext,
    workers: WorkerSet,
    reader: ReaderSlot,
    inner: Mutex<TranscodeInner>,
}

impl TranscodeBuffer {
    pub fn new(context: StreamContext) -> Self {
        Self {
            context,
            workers: WorkerSet::new("transcode"),
            reader: ReaderSlot::new(),
            inner: Mutex::new(TranscodeInner::default()),
        }
    }

    /// URL the host can play directly once the transcode is ready.
    pub fn playable_url(&self) -> Option<String> {
        self.inner.lock().playable_url.clone()
    }

    async fn wait_until_ready(&self, url: &str) -> TimeshiftResult<()> {
        let backend = &self.context.backend;
        for attempt in 1..=MAX_STATUS_POLLS {
            match backend.transcode_status(url).await {
                Ok(TranscodeStatus::Ready) => {
                    debug!("Transcode of {} ready after {} polls", url, attempt);
                    return Ok(());
                }
                Ok(TranscodeStatus::Failed) => {
                    return Err(TimeshiftError::TranscodeFailed {
                        stream: url.to_string(),
                    });
                }
                Ok(TranscodeStatus::Preparing(percent)) => {
                    debug!("Transcode of {} at {}%", url, percent);
                }
                Err(e) => warn!("Transcode status poll failed: {}", e),
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
        Err(TimeshiftError::PrebufferTimeout {
            waited_ms: (STATUS_POLL_INTERVAL * MAX_STATUS_POLLS).as_millis() as u64,
        })
    }

    async fn start(&self, url: &str) -> TimeshiftResult<()> {
        let profile = self.context.config.backend.transcode_profile.clone();
        self.context.backend.start_transcode(url, &profile).await?;
        self.wait_until_ready(url).await?;

        let playable_url = self.context.backend.transcode_url(url);
        let reader = self.context.transport.open(&playable_url, 0).await?;
        let (length, seekable) = (reader.length(), reader.is_seekable());
        self.reader.replace(reader).await;
        {
            let mut inner = self.inner.lock();
            inner.playable_url = Some(playable_url);
            inner.length = length;
            inner.seekable = seekable;
        }

        let streaming = &self.context.config.streaming;
        let lease: Arc<dyn LeaseTarget> = Arc::new(TranscodeLease {
            stream: url.to_string(),
            backend: Arc::clone(&self.context.backend),
            refresh_interval: streaming.lease_interval,
        });
        let schedule = LeaseSchedule::new(
            streaming.lease_interval,
            streaming.lease_retry_interval,
            streaming.lease_interval,
        );
        self.workers
            .spawn(run_lease_worker(lease, schedule, self.workers.subscribe()));
        Ok(())
    }

    async fn stop_remote(&self, url: &str) {
        if let Err(e) = self.context.backend.stop_transcode(url).await {
            warn!("Failed to stop transcode of {}: {}", url, e);
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for TranscodeBuffer {
    fn name(&self) -> &'static str {
        "transcode"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            *inner = TranscodeInner {
                state: StreamState::Opening,
                stream: url.to_string(),
                ..Default::default()
            };
        }
        self.workers.rearm();

        if let Err(e) = self.start(url).await {
            warn!("Transcode of {} failed to start: {}", url, e);
            self.workers.stop(LEASE_JOIN_TIMEOUT).await;
            self.reader.clear().await;
            self.stop_remote(url).await;
            self.inner.lock().state = StreamState::Closed;
            return Err(e);
        }

        self.inner.lock().state = StreamState::Active;
        info!("Opened transcode of {}", url);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> usize {
        if !self.inner.lock().state.is_open() {
            return 0;
        }
        let mut shutdown = self.workers.subscribe();
        match self.reader.read(buf, &mut shutdown).await {
            SlotRead::Data(count) => {
                self.inner.lock().position += count as u64;
                count
            }
            SlotRead::Failed(e) => {
                warn!("Transcode read failed: {}", e);
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
                Some(actual)
            }
            Err(e) => {
                warn!("Transcode seek failed: {}", e);
                None
            }
        }
    }

    async fn close(&self) {
        let stream = {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Closed {
                return;
            }
            inner.state = StreamState::Closing;
            inner.stream.clone()
        };

        self.stop_remote(&stream).await;
        if !self.workers.stop(LEASE_JOIN_TIMEOUT).await {
            warn!(
                "Transcode lease worker for {} did not stop within {:?}",
                stream, LEASE_JOIN_TIMEOUT
            );
        }
        self.reader.clear().await;

        let mut inner = self.inner.lock();
        inner.playable_url = None;
        inner.state = StreamState::Closed;
        info!("Closed transcode of {}", stream);
    }

    fn position(&self) -> u64 {
        self.inner.lock().position
    }

    fn length(&self) -> u64 {
        let inner = self.inner.lock();
        inner.length.unwrap_or(inner.position)
    }

    fn can_pause_stream(&self) -> bool {
        false
    }

    async fn pause_stream(&self, _paused: bool) {}

    fn can_seek_stream(&self) -> bool {
        self.inner.lock().seekable
    }

    fn is_real_time_stream(&self) -> bool {
        self.inner.lock().state.is_open()
    }

    fn stream_times(&self) -> Option<StreamTimes> {
        None
    }

    fn read_chunk_size(&self) -> usize {
        self.context.config.streaming.live_chunk_size
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn is_complete(&self) -> bool {
        false
    }
}
