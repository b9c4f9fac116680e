//! Shared state of a block-window session and the task that fills it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::protocol::{BlockHeader, BlockRequest, read_header};
use crate::backend::{Backend, LeaseKind};
use crate::config::TimeshiftConfig;
use crate::timeshift::circular::CircularBuffer;
use crate::timeshift::lease::LeaseTarget;
use crate::timeshift::seeker::Seeker;
use crate::timeshift::session::{SessionState, StreamState};
use crate::transport::BoxedSocket;

/// Everything guarded by the session lock.
pub(crate) struct RingInner {
    pub lifecycle: StreamState,
    pub stream: String,
    pub buffer: CircularBuffer,
    pub session: SessionState,
    pub seeker: Seeker,
    pub complete: bool,
    pub failed: bool,
    pub poll_failures: u32,
}

impl RingInner {
    fn new(config: &TimeshiftConfig) -> Self {
        Self {
            lifecycle: StreamState::Closed,
            stream: String::new(),
            buffer: CircularBuffer::new(config.ring.capacity()),
            session: SessionState::new(config.ring.block_size),
            seeker: Seeker::new(config.ring.block_size),
            complete: false,
            failed: false,
            poll_failures: 0,
        }
    }

    /// Prepares for a new stream, keeping the allocated buffer.
    pub fn restart(&mut self, stream: &str, block_size: usize) {
        self.lifecycle = StreamState::Opening;
        self.stream = stream.to_string();
        self.buffer.reset();
        self.session = SessionState::new(block_size);
        self.seeker = Seeker::new(block_size);
        self.complete = false;
        self.failed = false;
        self.poll_failures = 0;
    }

    /// Every byte of a finished stream has been buffered or read.
    pub fn at_end(&self) -> bool {
        self.complete
            && !self.seeker.is_seeking()
            && self.session.buffered_end(self.buffer.bytes_available())
                >= self.session.last_known_length
    }

    /// Moves the reader to the end of a finished stream without a request.
    ///
    /// Buffered bytes up to the end are skipped. Otherwise the buffer is
    /// discarded and the window abandoned so nothing past the end is asked for.
    pub fn settle_at_end(&mut self) -> u64 {
        let length = self.session.last_known_length;
        let position = self.session.stream_position;
        let buffered_end = self.session.buffered_end(self.buffer.bytes_available());
        if position <= length && buffered_end >= length {
            self.buffer.adjust_bytes((length - position) as i64);
        } else {
            debug!("Seek to end {} discards the buffer at {}", length, position);
            self.buffer.reset();
            self.session.abandon_window();
            self.session.last_block_buffered = None;
            self.session.request_block = self.session.request_block.max(length);
            self.session.reset_origin = length;
        }
        self.session.stream_position = length;
        length
    }
}

/// State shared between the host-facing strategy and its tasks.
pub(crate) struct RingShared {
    pub inner: Mutex<RingInner>,
    /// Buffered data grew, the session failed or closed
    pub data_ready: Notify,
    /// Buffer space was freed or a seek needs new requests
    pub space_freed: Notify,
    pub seek_done: Notify,
    pub config: Arc<TimeshiftConfig>,
    backend: Arc<dyn Backend>,
}

impl RingShared {
    pub fn new(config: Arc<TimeshiftConfig>, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Mutex::new(RingInner::new(&config)),
            data_ready: Notify::new(),
            space_freed: Notify::new(),
            seek_done: Notify::new(),
            config,
            backend,
        }
    }

    /// Wakes every waiter so it re-checks the session state.
    pub fn wake_all(&self) {
        self.data_ready.notify_waiters();
        self.seek_done.notify_waiters();
        self.space_freed.notify_one();
    }

    fn fail(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            let running = inner.lifecycle.is_open() || inner.lifecycle == StreamState::Opening;
            if inner.failed || !running {
                return;
            }
            inner.failed = true;
        }
        error!("Block connection failed: {}", reason);
        self.wake_all();
    }

    /// Requests to send now, bounded by the window and free buffer space.
    fn next_requests(&self) -> Vec<BlockRequest> {
        let block_size = self.config.ring.block_size;
        let window_size = self.config.ring.window_size;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.failed {
            return Vec::new();
        }
        inner.seeker.process_requests(&mut inner.session);

        let mut requests = Vec::new();
        loop {
            let session = &mut inner.session;
            if session.outstanding() >= window_size {
                break;
            }
            // Keep one spare block so the block behind the cursor survives.
            let needed = block_size * (session.current_window_size + 2);
            if !inner.seeker.is_seeking() && inner.buffer.bytes_free() < needed {
                break;
            }
            // A pending seek target is always asked for, even a zero-length end block.
            let seek_target = inner.seeker.is_seeking()
                && session.request_block == inner.seeker.target_block();
            if inner.complete
                && session.request_block >= session.last_known_length
                && !seek_target
            {
                break;
            }

            session.request_number += 1;
            requests.push(BlockRequest {
                offset: session.request_block,
                length: block_size as u64,
                sequence: session.request_number,
            });
            session.request_block += block_size as u64;
            session.current_window_size += 1;
        }
        requests
    }

    fn outstanding(&self) -> usize {
        self.inner.lock().session.outstanding()
    }

    /// Applies one response from the server.
    fn ingest(&self, header: &BlockHeader, payload: &[u8]) {
        let now = Instant::now();
        let retention = self.config.streaming.timeshift_buffer;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.session.update_length(header.total, now, retention);

        if inner.session.stale_responses > 0 {
            inner.session.stale_responses -= 1;
            debug!("Discarded stale block at {}", header.offset);
            return;
        }
        inner.session.current_window_size = inner.session.current_window_size.saturating_sub(1);

        // Live blocks are only answered once whole; a short one ends the stream.
        let ended = (payload.len() as u64) < self.config.ring.block_size as u64
            && header.offset + header.size >= header.total;
        if ended && !inner.complete {
            debug!("Stream ended at {}", header.total);
            inner.complete = true;
        }

        if inner.seeker.is_seeking() {
            let landed = inner.seeker.postprocess_seek(
                &mut inner.session,
                &mut inner.buffer,
                header.offset,
                payload,
            );
            drop(guard);
            if landed {
                debug!("Seek landed on block {}", header.offset);
                self.seek_done.notify_waiters();
                self.data_ready.notify_waiters();
            }
            return;
        }

        if payload.is_empty() {
            drop(guard);
            if ended {
                self.data_ready.notify_waiters();
            }
            return;
        }
        if !inner.buffer.write_bytes(payload) {
            warn!(
                "Dropping block at {}: {} bytes free",
                header.offset,
                inner.buffer.bytes_free()
            );
            return;
        }
        inner.session.last_block_buffered = Some(header.offset);
        inner.session.last_buffer_time = Some(now);
        drop(guard);
        self.data_ready.notify_waiters();
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Keeps the request window full and moves responses into the buffer.
pub(crate) async fn run_producer(
    shared: Arc<RingShared>,
    socket: BoxedSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut payload = vec![0u8; shared.config.ring.block_size];

    loop {
        if stopping(&shutdown) {
            break;
        }

        for request in shared.next_requests() {
            debug!(
                "Requesting block {} (seq {})",
                request.offset, request.sequence
            );
            if let Err(e) = writer.write_all(&request.encode()).await {
                shared.fail(&format!("request write failed: {e}"));
                return;
            }
        }

        if shared.outstanding() == 0 {
            tokio::select! {
                _ = shared.space_freed.notified() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let header = tokio::select! {
            header = read_header(&mut reader) => header,
            _ = shutdown.changed() => continue,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => {
                shared.fail("server closed the connection");
                return;
            }
            Err(e) => {
                shared.fail(&format!("header read failed: {e}"));
                return;
            }
        };

        let size = header.size as usize;
        if size > payload.len() {
            shared.fail(&format!("block of {size} bytes exceeds block size"));
            return;
        }
        let body = tokio::select! {
            body = reader.read_exact(&mut payload[..size]) => body,
            _ = shutdown.changed() => continue,
        };
        if let Err(e) = body {
            shared.fail(&format!("payload read failed: {e}"));
            return;
        }

        shared.ingest(&header, &payload[..size]);
    }

    debug!("Block producer stopped");
}

/// Interval before re-polling after a failed metadata request.
const POLL_RETRY: Duration = Duration::from_millis(500);

#[async_trait]
impl LeaseTarget for RingShared {
    async fn renew_lease(&self) -> bool {
        let stream = {
            let inner = self.inner.lock();
            if !inner.session.is_paused {
                return true;
            }
            inner.stream.clone()
        };

        match self.backend.lease(&stream, LeaseKind::Stream).await {
            Ok(()) => {
                self.inner.lock().session.last_pause_adjust = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!("Stream lease for paused timeshift failed: {}", e);
                false
            }
        }
    }

    async fn refresh(&self) -> Duration {
        let stream = self.inner.lock().stream.clone();
        let interval = self.config.streaming.refresh_interval;

        match self.backend.stream_info(&stream).await {
            Ok(info) => {
                {
                    let mut inner = self.inner.lock();
                    inner.poll_failures = 0;
                    inner.complete = info.complete;
                    inner.session.update_length(
                        info.length,
                        Instant::now(),
                        self.config.streaming.timeshift_buffer,
                    );
                }
                if info.complete {
                    // Readers waiting at the end can now return end of stream.
                    self.data_ready.notify_waiters();
                }
                interval
            }
            Err(e) => {
                let failures = {
                    let mut inner = self.inner.lock();
                    inner.poll_failures += 1;
                    inner.poll_failures
                };
                if failures >= self.config.streaming.max_poll_failures {
                    self.fail(&format!("{failures} consecutive metadata polls failed: {e}"));
                } else {
                    warn!("Timeshift metadata poll failed ({}): {}", failures, e);
                }
                POLL_RETRY.min(interval)
            }
        }
    }
}
