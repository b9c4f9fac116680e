//! Timeshift over one growing remote file.
//!
//! The backend appends the live stream to a single file; the client keeps a
//! seek floor so only the last `timeshift_buffer` of it is reachable.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::handle::{ReaderSlot, SlotRead};
use super::lease::{LeaseSchedule, LeaseTarget, run_lease_worker};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};
use crate::backend::{Backend, BackendError, LeaseKind, StreamInfo};
use crate::config::TimeshiftConfig;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait between reopen attempts while reading at the live edge.
const EDGE_POLL: Duration = Duration::from_millis(250);

struct ClientInner {
    lifecycle: StreamState,
    stream: String,
    position: u64,
    length: u64,
    duration: Duration,
    complete: bool,
    failed: bool,
    poll_failures: u32,
    seek_floor: u64,
    started_at: Instant,
    start_time: DateTime<Utc>,
    paused_at: Option<u64>,
}

impl ClientInner {
    fn new(stream: &str) -> Self {
        Self {
            lifecycle: StreamState::Opening,
            stream: stream.to_string(),
            position: 0,
            length: 0,
            duration: Duration::ZERO,
            complete: false,
            failed: false,
            poll_failures: 0,
            seek_floor: 0,
            started_at: Instant::now(),
            start_time: Utc::now(),
            paused_at: None,
        }
    }

    /// Earliest offset inside the retention window.
    ///
    /// `length × (1 − retention / duration)` once more than `retention` has
    /// been written; never moves backwards.
    fn update_floor(&mut self, retention: Duration) {
        if self.duration <= retention || self.duration.is_zero() {
            return;
        }
        let kept = retention.as_secs_f64() / self.duration.as_secs_f64();
        let floor = (self.length as f64 * (1.0 - kept)) as u64;
        self.seek_floor = self.seek_floor.max(floor);
    }

    /// Media time of the seek floor from the start of the file.
    fn floor_time(&self) -> Duration {
        if self.length == 0 {
            return Duration::ZERO;
        }
        self.duration
            .mul_f64(self.seek_floor as f64 / self.length as f64)
    }
}

struct ClientShared {
    inner: Mutex<ClientInner>,
    config: Arc<TimeshiftConfig>,
    backend: Arc<dyn Backend>,
}

impl ClientShared {
    fn apply(&self, info: &StreamInfo) {
        let mut inner = self.inner.lock();
        inner.poll_failures = 0;
        inner.length = inner.length.max(info.length);
        inner.duration = info.duration;
        inner.complete = info.complete;
        inner.update_floor(self.config.streaming.timeshift_buffer);
    }
}

#[async_trait]
impl LeaseTarget for ClientShared {
    async fn renew_lease(&self) -> bool {
        let stream = self.inner.lock().stream.clone();
        match self.backend.lease(&stream, LeaseKind::Stream).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Client timeshift lease failed: {}", e);
                false
            }
        }
    }

    async fn refresh(&self) -> Duration {
        let interval = self.config.streaming.refresh_interval;
        let stream = self.inner.lock().stream.clone();

        match self.backend.stream_info(&stream).await {
            Ok(info) => {
                self.apply(&info);
                interval
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.poll_failures += 1;
                if inner.poll_failures >= self.config.streaming.max_poll_failures {
                    if !inner.failed {
                        warn!(
                            "Client timeshift {} lost after {} failed polls: {}",
                            stream, inner.poll_failures, e
                        );
                    }
                    inner.failed = true;
                } else {
                    warn!("Client timeshift poll failed ({}): {}", inner.poll_failures, e);
                }
                interval / 2
            }
        }
    }
}

/// Client-side timeshift over a growing file.
pub struct ClientTimeshift {
    context: StreamContext,
    shared: Arc<ClientShared>,
    workers: WorkerSet,
    reader: ReaderSlot,
    io_lock: tokio::sync::Mutex<()>,
}

impl ClientTimeshift {
    pub fn new(context: StreamContext) -> Self {
        let mut inner = ClientInner::new("");
        inner.lifecycle = StreamState::Closed;
        let shared = Arc::new(ClientShared {
            inner: Mutex::new(inner),
            config: Arc::clone(&context.config),
            backend: Arc::clone(&context.backend),
        });
        Self {
            context,
            shared,
            workers: WorkerSet::new("client"),
            reader: ReaderSlot::new(),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Earliest reachable offset.
    pub fn seek_floor(&self) -> u64 {
        self.shared.inner.lock().seek_floor
    }

    async fn prebuffer(&self, url: &str) -> TimeshiftResult<()> {
        let streaming = &self.context.config.streaming;
        let deadline = Instant::now() + streaming.prebuffer_timeout;

        loop {
            match self.context.backend.stream_info(url).await {
                Ok(info) if info.complete && info.duration.is_zero() => {
                    return Err(TimeshiftError::StreamNotReady {
                        reason: format!("{url} finished without any data"),
                    });
                }
                Ok(info) => {
                    self.shared.apply(&info);
                    if info.complete || info.duration >= streaming.prebuffer {
                        return Ok(());
                    }
                }
                Err(e @ BackendError::NotFound { .. }) => return Err(e.into()),
                Err(e) => warn!("Waiting for client timeshift {}: {}", url, e),
            }
            if Instant::now() + streaming.refresh_interval > deadline {
                return Err(TimeshiftError::PrebufferTimeout {
                    waited_ms: streaming.prebuffer_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(streaming.refresh_interval).await;
        }
    }

    async fn start(&self, url: &str) -> TimeshiftResult<()> {
        self.context.backend.start_stream(url).await?;
        self.prebuffer(url).await?;

        let reader = self.context.transport.open(url, 0).await?;
        self.reader.replace(reader).await;

        let streaming = &self.context.config.streaming;
        let schedule = LeaseSchedule::new(
            streaming.lease_interval,
            streaming.lease_retry_interval,
            streaming.refresh_interval,
        );
        let target: Arc<dyn LeaseTarget> = self.shared.clone();
        self.workers
            .spawn(run_lease_worker(target, schedule, self.workers.subscribe()));
        Ok(())
    }

    async fn reopen_at(&self, position: u64) -> bool {
        let stream = self.shared.inner.lock().stream.clone();
        match self.context.transport.open(&stream, position).await {
            Ok(reader) => {
                self.reader.replace(reader).await;
                true
            }
            Err(e) => {
                warn!("Failed to reopen client timeshift at {}: {}", position, e);
                self.reader.clear().await;
                false
            }
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for ClientTimeshift {
    fn name(&self) -> &'static str {
        "client"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            *inner = ClientInner::new(url);
        }
        self.workers.rearm();

        if let Err(e) = self.start(url).await {
            self.workers.stop(CLOSE_TIMEOUT).await;
            self.reader.clear().await;
            if let Err(stop_error) = self.context.backend.stop_stream(url).await {
                debug!("Stop after failed open: {}", stop_error);
            }
            self.shared.inner.lock().lifecycle = StreamState::Closed;
            return Err(e);
        }

        self.shared.inner.lock().lifecycle = StreamState::Active;
        info!("Opened client timeshift {}", url);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let _io = self.io_lock.lock().await;
        let mut shutdown = self.workers.subscribe();
        let deadline = Instant::now() + self.context.config.streaming.read_timeout;

        loop {
            {
                let inner = self.shared.inner.lock();
                if inner.lifecycle != StreamState::Active || inner.failed {
                    return 0;
                }
            }

            match self.reader.read(buf, &mut shutdown).await {
                SlotRead::Data(count) if count > 0 => {
                    let mut inner = self.shared.inner.lock();
                    inner.position += count as u64;
                    inner.length = inner.length.max(inner.position);
                    return count;
                }
                SlotRead::Closed => return 0,
                SlotRead::Failed(e) => warn!("Client timeshift read failed: {}", e),
                SlotRead::Data(_) | SlotRead::Empty => {}
            }

            let position = {
                let inner = self.shared.inner.lock();
                if inner.complete && inner.position >= inner.length {
                    return 0;
                }
                inner.position
            };
            if Instant::now() >= deadline {
                return 0;
            }

            // Wait for the file to grow past the current position.
            let wait = EDGE_POLL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return 0,
            }
            self.reopen_at(position).await;
        }
    }

    async fn seek(&self, position: SeekFrom) -> Option<u64> {
        let _io = self.io_lock.lock().await;
        let target = {
            let inner = self.shared.inner.lock();
            if !inner.lifecycle.is_open() || inner.failed {
                return None;
            }
            resolve_seek(position, inner.position, inner.length)?
                .max(inner.seek_floor)
                .min(inner.length)
        };

        let paused = self.shared.inner.lock().lifecycle == StreamState::Paused;
        if paused {
            self.shared.inner.lock().paused_at = Some(target);
        } else {
            let repositioned = matches!(self.reader.seek(target).await, Some(Ok(_)));
            if !repositioned && !self.reopen_at(target).await {
                return None;
            }
        }

        self.shared.inner.lock().position = target;
        debug!("Client timeshift seeked to {}", target);
        Some(target)
    }

    async fn close(&self) {
        let stream = {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle == StreamState::Closed {
                return;
            }
            inner.lifecycle = StreamState::Closing;
            inner.stream.clone()
        };

        if !self.workers.stop(CLOSE_TIMEOUT).await {
            warn!("Client timeshift workers for {} were aborted", stream);
        }
        self.reader.clear().await;
        if let Err(e) = self.context.backend.stop_stream(&stream).await {
            warn!("Failed to stop client timeshift {}: {}", stream, e);
        }
        self.shared.inner.lock().lifecycle = StreamState::Closed;
        info!("Closed client timeshift {}", stream);
    }

    fn position(&self) -> u64 {
        self.shared.inner.lock().position
    }

    fn length(&self) -> u64 {
        self.shared.inner.lock().length
    }

    fn can_pause_stream(&self) -> bool {
        true
    }

    async fn pause_stream(&self, paused: bool) {
        let _io = self.io_lock.lock().await;
        let resume_at = {
            let mut inner = self.shared.inner.lock();
            match (paused, inner.lifecycle) {
                (true, StreamState::Active) => {
                    inner.paused_at = Some(inner.position);
                    inner.lifecycle = StreamState::Paused;
                    None
                }
                (false, StreamState::Paused) => {
                    inner.lifecycle = StreamState::Active;
                    inner.paused_at.take()
                }
                _ => return,
            }
        };

        match resume_at {
            None => debug!("Client timeshift paused, transport kept open"),
            Some(position) => {
                let position = position.max(self.seek_floor());
                self.shared.inner.lock().position = position;
                self.reopen_at(position).await;
                debug!("Client timeshift resumed at {}", position);
            }
        }
    }

    fn can_seek_stream(&self) -> bool {
        true
    }

    fn is_real_time_stream(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.lifecycle.is_open()
            && !inner.failed
            && inner.started_at.elapsed() < self.context.config.streaming.real_time_grace
    }

    fn stream_times(&self) -> Option<StreamTimes> {
        let inner = self.shared.inner.lock();
        if !inner.lifecycle.is_open() {
            return None;
        }
        Some(StreamTimes::new(
            inner.start_time,
            self.context.config.backend.server_time_offset_secs,
            inner.floor_time(),
            inner.duration,
        ))
    }

    fn read_chunk_size(&self) -> usize {
        self.context.config.streaming.live_chunk_size
    }

    fn state(&self) -> StreamState {
        self.shared.inner.lock().lifecycle
    }

    fn is_complete(&self) -> bool {
        self.shared.inner.lock().complete
    }
}
