//! Timeshift over the backend's rotating segment files.
//!
//! The backend writes the live stream into a sequence of files and reports
//! them with their logical start offsets. The lease worker keeps the segment
//! list fresh; reads walk from one segment to the next and seeks map an
//! absolute offset onto the segment holding it.

mod window;

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use window::{RollingInner, RollingShared};

use super::handle::{ReaderSlot, SlotRead};
use super::lease::{LeaseSchedule, LeaseTarget, run_lease_worker};
use super::segments::{RotationMode, Segment};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};
use crate::backend::{BackendError, StreamInfo};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait between polls while reading at the live edge.
const EDGE_POLL: Duration = Duration::from_millis(250);

enum ReadPlan {
    Open { url: String, segment: u64, offset: u64 },
    Read,
    Wait,
}

/// Rolling-file timeshift.
pub struct RollingFile {
    context: StreamContext,
    shared: Arc<RollingShared>,
    workers: WorkerSet,
    reader: ReaderSlot,
    io_lock: tokio::sync::Mutex<()>,
}

impl RollingFile {
    pub fn new(context: StreamContext) -> Self {
        let shared = Arc::new(RollingShared {
            inner: Mutex::new(RollingInner::new(context.config.streaming.max_segments)),
            config: Arc::clone(&context.config),
            backend: Arc::clone(&context.backend),
        });
        Self {
            context,
            shared,
            workers: WorkerSet::new("rolling"),
            reader: ReaderSlot::new(),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current segment list, oldest first.
    pub fn segments(&self) -> Vec<Segment> {
        self.shared.inner.lock().segments.iter().cloned().collect()
    }

    pub fn rotation_mode(&self) -> RotationMode {
        self.shared.inner.lock().rotation
    }

    /// Polls until the stream has a segment and `prebuffer` of media.
    async fn wait_for_stream(&self, url: &str) -> TimeshiftResult<StreamInfo> {
        let streaming = &self.context.config.streaming;
        let deadline = Instant::now() + streaming.prebuffer_timeout;

        loop {
            match self.context.backend.stream_info(url).await {
                Ok(info) if info.complete && info.duration.is_zero() => {
                    return Err(TimeshiftError::StreamNotReady {
                        reason: format!("{url} finished without any data"),
                    });
                }
                Ok(info)
                    if !info.segments.is_empty()
                        && (info.complete || info.duration >= streaming.prebuffer) =>
                {
                    return Ok(info);
                }
                Ok(_) => {}
                Err(e @ BackendError::NotFound { .. }) => return Err(e.into()),
                Err(e) => warn!("Waiting for rolling stream {}: {}", url, e),
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
        let capabilities = match self.context.backend.capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!("Capability query failed, assuming interval rollover: {}", e);
                Default::default()
            }
        };
        let rotation = if capabilities.epg_rollover {
            RotationMode::Epg
        } else {
            RotationMode::Interval(self.context.config.streaming.rollover_interval)
        };
        self.shared.inner.lock().rotation = rotation;

        self.context.backend.start_stream(url).await?;
        let info = self.wait_for_stream(url).await?;
        self.shared.apply(info);

        let (target, segment, segment_url) = {
            let mut inner = self.shared.inner.lock();
            let lead = inner.byte_rate() * self.context.config.streaming.prebuffer.as_secs();
            let target = inner
                .length
                .saturating_sub(lead)
                .max(inner.segments.window_start());
            let segment = inner.segments.find(target).cloned().ok_or_else(|| {
                TimeshiftError::StreamNotReady {
                    reason: format!("no segment holds offset {target}"),
                }
            })?;
            inner.position = target;
            inner.window_start_time = Utc::now()
                - chrono::Duration::from_std(inner.retained_duration()).unwrap_or_default();
            let segment_url = self.context.backend.segment_url(url, &segment.filename);
            (target, segment, segment_url)
        };

        let reader = self
            .context
            .transport
            .open(&segment_url, target - segment.offset)
            .await?;
        self.reader.replace(reader).await;
        self.shared.inner.lock().active = Some(segment.offset);

        let streaming = &self.context.config.streaming;
        let schedule = LeaseSchedule::new(
            streaming.lease_interval,
            streaming.lease_retry_interval,
            streaming.refresh_interval,
        );
        let lease_target: Arc<dyn LeaseTarget> = self.shared.clone();
        self.workers
            .spawn(run_lease_worker(lease_target, schedule, self.workers.subscribe()));

        info!(
            "Opened rolling stream {} at {} in {} ({:?} rollover)",
            url, target, segment.filename, rotation
        );
        Ok(())
    }

    fn plan_read(&self) -> Option<ReadPlan> {
        let mut inner = self.shared.inner.lock();
        if !inner.lifecycle.is_open() || inner.failed || inner.at_end() {
            return None;
        }
        if inner.position < inner.segments.window_start() {
            // The reader fell out of the retained window.
            let start = inner.segments.window_start();
            warn!("Position {} rolled off, skipping to {}", inner.position, start);
            inner.position = start;
            inner.reopen = true;
        }

        let position = inner.position;
        let Some(segment) = inner.segments.find(position) else {
            return Some(ReadPlan::Wait);
        };
        if inner.active == Some(segment.offset) && !inner.reopen {
            return Some(ReadPlan::Read);
        }
        Some(ReadPlan::Open {
            url: self.context.backend.segment_url(&inner.stream, &segment.filename),
            segment: segment.offset,
            offset: position - segment.offset,
        })
    }

    async fn open_segment(&self, url: &str, segment: u64, offset: u64) -> bool {
        match self.context.transport.open(url, offset).await {
            Ok(reader) => {
                self.reader.replace(reader).await;
                let mut inner = self.shared.inner.lock();
                inner.active = Some(segment);
                inner.reopen = false;
                debug!("Reading segment at {} from {}", segment, offset);
                true
            }
            Err(e) => {
                warn!("Failed to open segment {}: {}", url, e);
                self.shared.inner.lock().active = None;
                false
            }
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for RollingFile {
    fn name(&self) -> &'static str {
        "rolling"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            *inner = RollingInner::new(self.context.config.streaming.max_segments);
            inner.stream = url.to_string();
            inner.lifecycle = StreamState::Opening;
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
            let Some(plan) = self.plan_read() else {
                return 0;
            };

            let mut readable = true;
            match plan {
                ReadPlan::Open { url, segment, offset } => {
                    readable = self.open_segment(&url, segment, offset).await;
                }
                ReadPlan::Read => {}
                ReadPlan::Wait => readable = false,
            }

            if readable {
                match self.reader.read(buf, &mut shutdown).await {
                    SlotRead::Data(count) if count > 0 => {
                        let mut inner = self.shared.inner.lock();
                        inner.position += count as u64;
                        inner.length = inner.length.max(inner.position);
                        return count;
                    }
                    SlotRead::Closed => return 0,
                    SlotRead::Failed(e) => {
                        warn!("Segment read failed: {}", e);
                        self.shared.inner.lock().active = None;
                    }
                    SlotRead::Data(_) | SlotRead::Empty => {}
                }
            }

            // End of the data this segment has for now.
            let _ = self.shared.poll().await;
            {
                let mut inner = self.shared.inner.lock();
                let position = inner.position;
                let moved_on = inner
                    .segments
                    .find(position)
                    .is_some_and(|segment| inner.active != Some(segment.offset));
                if moved_on {
                    continue;
                }
                if inner.at_end() || inner.failed || Instant::now() >= deadline {
                    return 0;
                }
                // Newest segment is still growing: ask for it again from here.
                inner.reopen = true;
            }

            let wait = EDGE_POLL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return 0,
            }
        }
    }

    async fn seek(&self, position: SeekFrom) -> Option<u64> {
        let _io = self.io_lock.lock().await;

        let (target, segment, url, same) = {
            let inner = self.shared.inner.lock();
            if !inner.lifecycle.is_open() || inner.failed {
                return None;
            }
            let target = resolve_seek(position, inner.position, inner.length)?
                .max(inner.segments.window_start())
                .min(inner.length);
            let segment = inner.segments.find(target)?;
            let same = inner.active == Some(segment.offset) && !inner.reopen;
            let url = self.context.backend.segment_url(&inner.stream, &segment.filename);
            (target, segment.offset, url, same)
        };

        let relative = target - segment;
        let repositioned = same && matches!(self.reader.seek(relative).await, Some(Ok(_)));
        if !repositioned && !self.open_segment(&url, segment, relative).await {
            return None;
        }

        self.shared.inner.lock().position = target;
        debug!("Rolling stream seeked to {}", target);
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
            warn!("Rolling stream workers for {} were aborted", stream);
        }
        self.reader.clear().await;
        if let Err(e) = self.context.backend.stop_stream(&stream).await {
            warn!("Failed to stop rolling stream {}: {}", stream, e);
        }
        self.shared.inner.lock().lifecycle = StreamState::Closed;
        info!("Closed rolling stream {}", stream);
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
        let mut inner = self.shared.inner.lock();
        if !inner.lifecycle.is_open() {
            return;
        }
        inner.lifecycle = if paused {
            StreamState::Paused
        } else {
            // The connection has likely been dropped while idle.
            inner.reopen = true;
            StreamState::Active
        };
    }

    fn can_seek_stream(&self) -> bool {
        true
    }

    fn is_real_time_stream(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.lifecycle.is_open() && !inner.failed && !inner.complete
    }

    fn stream_times(&self) -> Option<StreamTimes> {
        let inner = self.shared.inner.lock();
        if !inner.lifecycle.is_open() || inner.length == 0 {
            return None;
        }
        Some(StreamTimes::new(
            inner.window_start_time,
            self.context.config.backend.server_time_offset_secs,
            Duration::ZERO,
            inner.retained_duration(),
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
