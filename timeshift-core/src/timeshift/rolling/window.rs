//! Segment window bookkeeping shared with the lease worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, LeaseKind, StreamInfo};
use crate::config::TimeshiftConfig;
use crate::timeshift::StreamState;
use crate::timeshift::lease::LeaseTarget;
use crate::timeshift::segments::{RotationMode, SegmentList};

/// Poll this long after an expected rotation so the new file is listed.
const ROTATION_GRACE: Duration = Duration::from_millis(500);

pub(super) struct RollingInner {
    pub(super) lifecycle: StreamState,
    pub(super) stream: String,
    pub(super) segments: SegmentList,
    pub(super) rotation: RotationMode,
    pub(super) next_rotation: Option<Instant>,
    /// Offset of the segment the reader is open on
    pub(super) active: Option<u64>,
    /// The open reader must be reopened at `position`
    pub(super) reopen: bool,
    pub(super) position: u64,
    pub(super) length: u64,
    pub(super) duration: Duration,
    pub(super) complete: bool,
    pub(super) failed: bool,
    pub(super) poll_failures: u32,
    /// Wall-clock time of the oldest retained byte
    pub(super) window_start_time: DateTime<Utc>,
}

impl RollingInner {
    pub(super) fn new(max_segments: usize) -> Self {
        Self {
            lifecycle: StreamState::Closed,
            stream: String::new(),
            segments: SegmentList::new(max_segments),
            rotation: RotationMode::Interval(Duration::ZERO),
            next_rotation: None,
            active: None,
            reopen: false,
            position: 0,
            length: 0,
            duration: Duration::ZERO,
            complete: false,
            failed: false,
            poll_failures: 0,
            window_start_time: Utc::now(),
        }
    }

    pub(super) fn at_end(&self) -> bool {
        self.complete && self.position >= self.length
    }

    /// Playback time the retained segments cover.
    pub(super) fn retained_duration(&self) -> Duration {
        if self.length == 0 {
            return Duration::ZERO;
        }
        let retained = self.length - self.segments.window_start().min(self.length);
        self.duration.mul_f64(retained as f64 / self.length as f64)
    }

    /// Average bytes per second over the whole stream.
    pub(super) fn byte_rate(&self) -> u64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.length as f64 / secs) as u64
    }
}

pub(super) struct RollingShared {
    pub(super) inner: Mutex<RollingInner>,
    pub(super) config: Arc<TimeshiftConfig>,
    pub(super) backend: Arc<dyn Backend>,
}

impl RollingShared {
    /// Polls the backend and merges the result.
    pub(super) async fn poll(&self) -> Result<(), BackendError> {
        let stream = self.inner.lock().stream.clone();
        match self.backend.stream_info(&stream).await {
            Ok(info) => {
                self.apply(info);
                Ok(())
            }
            Err(e) => {
                let failures = {
                    let mut inner = self.inner.lock();
                    inner.poll_failures += 1;
                    if inner.poll_failures >= self.config.streaming.max_poll_failures {
                        inner.failed = true;
                    }
                    inner.poll_failures
                };
                if failures >= self.config.streaming.max_poll_failures {
                    warn!("Rolling stream {} lost after {} failed polls: {}", stream, failures, e);
                } else {
                    warn!("Rolling stream poll failed ({}): {}", failures, e);
                }
                Err(e)
            }
        }
    }

    pub(super) fn apply(&self, info: StreamInfo) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.poll_failures = 0;
        inner.length = inner.length.max(info.length);
        inner.duration = info.duration;
        inner.complete = info.complete;

        let fallback = self.config.streaming.rollover_interval;
        let now = Utc::now();
        let previous_newest = inner.segments.newest().map(|segment| segment.offset);
        let update = inner.segments.apply(&info.segments, now);
        if update.appended > 0 {
            if previous_newest.is_some() && inner.active == previous_newest {
                // The open file stopped growing; reopen to see its final length.
                inner.reopen = true;
            }
            if let Some(newest) = inner.segments.newest() {
                info!("Rolling stream rotated to {} at {}", newest.filename, newest.offset);
                let due = inner.rotation.next_rotation(newest, fallback);
                let delay = (due - now).to_std().unwrap_or_default();
                inner.next_rotation = Some(Instant::now() + delay);
            }
        }
        for segment in &update.evicted {
            let started = inner.window_start_time;
            inner.window_start_time = inner.rotation.segment_end(segment, started, fallback);
            debug!(
                "Segment {} left the window, which now starts at {}",
                segment.filename, inner.window_start_time
            );
        }
    }

    /// Delay until the next poll: the refresh interval, or shortly after
    /// the expected rotation when that comes sooner.
    pub(super) fn next_poll_delay(&self) -> Duration {
        let interval = self.config.streaming.refresh_interval;
        let Some(rotation) = self.inner.lock().next_rotation else {
            return interval;
        };
        let until = rotation.saturating_duration_since(Instant::now()) + ROTATION_GRACE;
        until.min(interval)
    }
}

#[async_trait]
impl LeaseTarget for RollingShared {
    async fn renew_lease(&self) -> bool {
        let stream = self.inner.lock().stream.clone();
        match self.backend.lease(&stream, LeaseKind::Stream).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Rolling stream lease failed: {}", e);
                false
            }
        }
    }

    async fn refresh(&self) -> Duration {
        match self.poll().await {
            Ok(()) => self.next_poll_delay(),
            Err(_) => self.config.streaming.refresh_interval / 2,
        }
    }
}
