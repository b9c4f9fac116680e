//! Window bookkeeping shared by the block-window producer, reader and seeker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Lifecycle of one stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Closed,
    Opening,
    Active,
    Paused,
    Closing,
}

impl StreamState {
    /// Whether reads and seeks are served in this state.
    pub fn is_open(self) -> bool {
        matches!(self, StreamState::Active | StreamState::Paused)
    }
}

/// Minimum spacing between length samples feeding the bitrate estimate.
const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Mutable window state of one block-window session.
///
/// Offsets are logical stream offsets. `request_block` is the offset of the
/// next block to request; `current_window_size` counts requests sent and not
/// yet answered, and `stale_responses` counts answers still owed for requests
/// abandoned by a hard reset.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub stream_position: u64,
    pub last_known_length: u64,
    pub request_block: u64,
    pub request_number: u64,
    pub current_window_size: usize,
    pub stale_responses: usize,
    pub last_block_buffered: Option<u64>,
    pub input_block_size: usize,
    /// Block-aligned offset of the first byte written since the last buffer reset
    pub reset_origin: u64,
    pub is_paused: bool,
    pub pause_start: Option<Instant>,
    pub last_pause_adjust: Option<Instant>,
    pub bytes_per_second: u64,
    /// Earliest offset still retained by the remote buffer
    pub tsb_start: u64,
    pub tsb_start_time: DateTime<Utc>,
    /// Whole seconds the remote buffer has discarded from its head
    pub tsb_roll_off: u64,
    pub session_start_time: DateTime<Utc>,
    pub last_buffer_time: Option<Instant>,
    rate_sample: Option<(Instant, u64)>,
}

impl SessionState {
    pub fn new(block_size: usize) -> Self {
        let now = Utc::now();
        Self {
            stream_position: 0,
            last_known_length: 0,
            request_block: 0,
            request_number: 0,
            current_window_size: 0,
            stale_responses: 0,
            last_block_buffered: None,
            input_block_size: block_size,
            reset_origin: 0,
            is_paused: false,
            pause_start: None,
            last_pause_adjust: None,
            bytes_per_second: 0,
            tsb_start: 0,
            tsb_start_time: now,
            tsb_roll_off: 0,
            session_start_time: now,
            last_buffer_time: None,
            rate_sample: None,
        }
    }

    /// Requests in flight, including those whose answers will be discarded.
    pub fn outstanding(&self) -> usize {
        self.current_window_size + self.stale_responses
    }

    /// Logical offset one past the last byte buffered for the reader.
    pub fn buffered_end(&self, bytes_available: usize) -> u64 {
        self.stream_position + bytes_available as u64
    }

    /// Records a total length reported by the remote side.
    ///
    /// Lengths never shrink. The bitrate estimate is refreshed from length
    /// growth at most once per second, and the retained window start follows
    /// from the estimate and `retention`.
    pub fn update_length(&mut self, total: u64, now: Instant, retention: Duration) {
        if total > self.last_known_length {
            self.last_known_length = total;
        }

        match self.rate_sample {
            None => self.rate_sample = Some((now, self.last_known_length)),
            Some((at, length)) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed >= RATE_SAMPLE_INTERVAL && self.last_known_length > length {
                    let grown = self.last_known_length - length;
                    let rate = (grown as f64 / elapsed.as_secs_f64()) as u64;
                    self.bytes_per_second = if self.bytes_per_second == 0 {
                        rate
                    } else {
                        (self.bytes_per_second * 3 + rate) / 4
                    };
                    self.rate_sample = Some((now, self.last_known_length));
                }
            }
        }

        self.update_retained_window(retention);
    }

    fn update_retained_window(&mut self, retention: Duration) {
        if self.bytes_per_second == 0 {
            return;
        }
        let retained = self.bytes_per_second.saturating_mul(retention.as_secs());
        let start = self.last_known_length.saturating_sub(retained);
        if start > self.tsb_start {
            self.tsb_start = start;
            self.tsb_roll_off = start / self.bytes_per_second;
            self.tsb_start_time =
                self.session_start_time + chrono::Duration::seconds(self.tsb_roll_off as i64);
        }
    }

    /// Seconds of media between the retained window start and the live edge.
    pub fn buffered_duration(&self) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        let bytes = self.last_known_length.saturating_sub(self.tsb_start);
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64)
    }

    /// Marks the session paused or resumed.
    pub fn set_paused(&mut self, paused: bool, now: Instant) {
        if paused && !self.is_paused {
            self.pause_start = Some(now);
            self.last_pause_adjust = Some(now);
        } else if !paused {
            self.pause_start = None;
        }
        self.is_paused = paused;
    }

    /// Drops window bookkeeping after the buffer has been discarded.
    pub fn abandon_window(&mut self) {
        self.stale_responses += self.current_window_size;
        self.current_window_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_open() {
        assert!(StreamState::Active.is_open());
        assert!(StreamState::Paused.is_open());
        assert!(!StreamState::Opening.is_open());
        assert!(!StreamState::Closed.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bitrate_from_length_growth() {
        let mut state = SessionState::new(32768);
        let retention = Duration::from_secs(3600);

        state.update_length(1_000, Instant::now(), retention);
        assert_eq!(state.bytes_per_second, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        state.update_length(5_000, Instant::now(), retention);
        assert_eq!(state.bytes_per_second, 2_000);
        assert_eq!(state.last_known_length, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_never_shrinks() {
        let mut state = SessionState::new(32768);
        state.update_length(10_000, Instant::now(), Duration::from_secs(60));
        state.update_length(4_000, Instant::now(), Duration::from_secs(60));
        assert_eq!(state.last_known_length, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_advances_window_start() {
        let mut state = SessionState::new(1024);
        let retention = Duration::from_secs(10);

        state.update_length(0, Instant::now(), retention);
        tokio::time::advance(Duration::from_secs(20)).await;
        state.update_length(20_000, Instant::now(), retention);

        assert_eq!(state.bytes_per_second, 1_000);
        assert_eq!(state.tsb_start, 10_000);
        assert_eq!(state.tsb_roll_off, 10);
        assert_eq!(state.buffered_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_abandon_window_moves_requests_to_stale() {
        let mut state = SessionState::new(1024);
        state.current_window_size = 4;
        state.stale_responses = 1;
        state.abandon_window();
        assert_eq!(state.current_window_size, 0);
        assert_eq!(state.outstanding(), 5);
    }
}
