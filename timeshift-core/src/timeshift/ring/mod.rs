//! Remote ring buffer read through the block-window protocol.
//!
//! The backend keeps the last `timeshift_buffer` of the live stream in its
//! own ring buffer. A producer task keeps up to `window_size` block requests
//! in flight over one socket and copies answers into the local
//! [`CircularBuffer`](crate::timeshift::CircularBuffer); host reads drain it.
//! Seeks go through the [`Seeker`](crate::timeshift::Seeker).

mod producer;
pub mod protocol;

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::producer::{RingShared, run_producer};
use super::lease::{LeaseSchedule, LeaseTarget, run_lease_worker};
use super::workers::WorkerSet;
use super::{
    StreamContext, StreamState, StreamTimes, TimeshiftBuffer, TimeshiftError, TimeshiftResult,
    resolve_seek,
};
use crate::transport::TransportError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeshift over the backend's ring buffer.
pub struct RingTimeshift {
    context: StreamContext,
    client_id: String,
    shared: Arc<RingShared>,
    workers: WorkerSet,
    seek_lock: tokio::sync::Mutex<()>,
}

impl RingTimeshift {
    pub fn new(context: StreamContext) -> Self {
        let shared = Arc::new(RingShared::new(
            Arc::clone(&context.config),
            Arc::clone(&context.backend),
        ));
        Self {
            context,
            client_id: format!("timeshift-{}", Uuid::new_v4()),
            shared,
            workers: WorkerSet::new("ring"),
            seek_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Identifier sent in the open line.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn connect_and_prebuffer(&self, url: &str) -> TimeshiftResult<()> {
        self.context.backend.start_stream(url).await?;

        let mut socket = self.context.connector.connect().await?;
        let open_line = protocol::encode_open(
            url,
            &self.client_id,
            &self.context.config.backend.session_id,
        );
        socket
            .write_all(&open_line)
            .await
            .map_err(TransportError::from)?;

        self.workers.spawn(run_producer(
            Arc::clone(&self.shared),
            socket,
            self.workers.subscribe(),
        ));

        let streaming = &self.context.config.streaming;
        let schedule = LeaseSchedule::new(
            streaming.lease_interval,
            streaming.lease_retry_interval,
            streaming.refresh_interval,
        );
        let target: Arc<dyn LeaseTarget> = self.shared.clone();
        self.workers
            .spawn(run_lease_worker(target, schedule, self.workers.subscribe()));

        self.wait_for_prebuffer().await
    }

    async fn wait_for_prebuffer(&self) -> TimeshiftResult<()> {
        let wanted = self.context.config.ring.prebuffer_bytes();
        let timeout = self.context.config.streaming.prebuffer_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.data_ready.notified();
            {
                let inner = self.shared.inner.lock();
                if inner.failed {
                    return Err(TimeshiftError::Protocol {
                        reason: "block connection failed while prebuffering".to_string(),
                    });
                }
                let available = inner.buffer.bytes_available();
                if available >= wanted || (inner.at_end() && inner.session.last_known_length > 0) {
                    debug!("Prebuffered {} bytes", available);
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TimeshiftError::PrebufferTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}

#[async_trait]
impl TimeshiftBuffer for RingTimeshift {
    fn name(&self) -> &'static str {
        "ring"
    }

    async fn open(&self, url: &str) -> TimeshiftResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle != StreamState::Closed {
                return Err(TimeshiftError::AlreadyOpen);
            }
            inner.restart(url, self.context.config.ring.block_size);
        }
        self.workers.rearm();

        if let Err(e) = self.connect_and_prebuffer(url).await {
            warn!("Failed to open timeshift stream {}: {}", url, e);
            self.shared.wake_all();
            self.workers.stop(CLOSE_TIMEOUT).await;
            if let Err(stop_error) = self.context.backend.stop_stream(url).await {
                debug!("Stop after failed open: {}", stop_error);
            }
            let mut inner = self.shared.inner.lock();
            inner.buffer.reset();
            inner.lifecycle = StreamState::Closed;
            return Err(e);
        }

        self.shared.inner.lock().lifecycle = StreamState::Active;
        info!("Opened timeshift stream {} as {}", url, self.client_id);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let ring = &self.context.config.ring;
        let wanted = buf.len().min(ring.capacity() - ring.block_size);
        let deadline = Instant::now() + self.context.config.streaming.read_timeout;

        loop {
            let notified = self.shared.data_ready.notified();
            {
                let mut inner = self.shared.inner.lock();
                if !inner.lifecycle.is_open() || inner.failed {
                    return 0;
                }
                let available = inner.buffer.bytes_available();
                if available >= wanted
                    || inner.at_end()
                    || Instant::now() >= deadline
                {
                    let count = inner.buffer.read_bytes(&mut buf[..wanted]);
                    inner.session.stream_position += count as u64;
                    drop(inner);
                    if count > 0 {
                        self.shared.space_freed.notify_one();
                    }
                    return count;
                }
            }
            // Timing out just loops back to hand over whatever is buffered.
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn seek(&self, position: SeekFrom) -> Option<u64> {
        let _serial = self.seek_lock.lock().await;

        let hard_reset = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;
            if !inner.lifecycle.is_open() || inner.failed {
                return None;
            }

            let current = inner.session.stream_position;
            let length = inner.session.last_known_length;
            let target = resolve_seek(position, current, length)?
                .max(inner.session.tsb_start)
                .min(length);
            if target == current {
                return Some(current);
            }
            if inner.complete && target >= length {
                let landed = inner.settle_at_end();
                drop(guard);
                self.shared.space_freed.notify_one();
                debug!("Seek to the end of finished stream at {}", landed);
                return Some(landed);
            }

            inner.seeker.init_seek(target);
            let hard_reset = inner.seeker.preprocess_seek(&mut inner.session, &mut inner.buffer);
            if !inner.seeker.is_seeking() {
                let landed = inner.session.stream_position;
                drop(guard);
                self.shared.space_freed.notify_one();
                debug!("Seek to {} served from buffer", landed);
                return Some(landed);
            }
            hard_reset
        };

        if hard_reset {
            debug!("Seek discarded the buffer, waiting for the target block");
        }
        self.shared.space_freed.notify_one();

        loop {
            let notified = self.shared.seek_done.notified();
            {
                let inner = self.shared.inner.lock();
                if !inner.lifecycle.is_open() || inner.failed {
                    return None;
                }
                if !inner.seeker.is_seeking() {
                    return Some(inner.session.stream_position);
                }
            }
            notified.await;
        }
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

        self.workers.signal();
        self.shared.wake_all();
        if !self.workers.stop(CLOSE_TIMEOUT).await {
            warn!("Timeshift workers for {} were aborted", stream);
        }
        if let Err(e) = self.context.backend.stop_stream(&stream).await {
            warn!("Failed to stop timeshift stream {}: {}", stream, e);
        }

        let mut inner = self.shared.inner.lock();
        inner.buffer.reset();
        inner.lifecycle = StreamState::Closed;
        info!("Closed timeshift stream {}", stream);
    }

    fn position(&self) -> u64 {
        self.shared.inner.lock().session.stream_position
    }

    fn length(&self) -> u64 {
        self.shared.inner.lock().session.last_known_length
    }

    fn can_pause_stream(&self) -> bool {
        true
    }

    async fn pause_stream(&self, paused: bool) {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.lifecycle.is_open() {
                return;
            }
            inner.session.set_paused(paused, Instant::now());
            inner.lifecycle = if paused {
                StreamState::Paused
            } else {
                StreamState::Active
            };
        }
        debug!("Timeshift {}", if paused { "paused" } else { "resumed" });
        if !paused {
            self.shared.space_freed.notify_one();
        }
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
        if !inner.lifecycle.is_open() {
            return None;
        }
        Some(StreamTimes::new(
            inner.session.tsb_start_time,
            self.context.config.backend.server_time_offset_secs,
            Duration::ZERO,
            inner.session.buffered_duration(),
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
