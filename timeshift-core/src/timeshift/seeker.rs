//! Seek reconciliation for the block-window protocol.
//!
//! A seek resolves in one of three ways: a cursor adjustment inside data
//! already buffered, a wait for a block that is already requested, or a hard
//! reset that discards the buffer and re-requests from the target block.

use tracing::debug;

use super::circular::CircularBuffer;
use super::session::SessionState;

/// Pending-seek state for one block-window session.
#[derive(Debug)]
pub struct Seeker {
    block_size: u64,
    target_block: u64,
    block_remainder: u64,
    seeking: bool,
    requested: bool,
}

impl Seeker {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size as u64,
            target_block: 0,
            block_remainder: 0,
            seeking: false,
            requested: false,
        }
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking
    }

    /// Whether the target block has been asked for.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Absolute offset the pending seek lands on.
    pub fn target(&self) -> u64 {
        self.target_block + self.block_remainder
    }

    pub fn target_block(&self) -> u64 {
        self.target_block
    }

    /// Starts a seek to an already-resolved absolute offset.
    pub fn init_seek(&mut self, target: u64) {
        self.target_block = target / self.block_size * self.block_size;
        self.block_remainder = target % self.block_size;
        self.seeking = true;
        self.requested = false;
    }

    /// Classifies the pending seek against buffered and requested data.
    ///
    /// Returns true when the buffer was discarded and the window abandoned.
    /// When it returns false the seek either completed in place or waits for
    /// a block already in flight (or about to be requested).
    pub fn preprocess_seek(
        &mut self,
        state: &mut SessionState,
        buffer: &mut CircularBuffer,
    ) -> bool {
        let target = self.target();
        let position = state.stream_position;
        let current_block = position / self.block_size * self.block_size;
        let buffered_end = state.buffered_end(buffer.bytes_available());

        if self.target_block == current_block {
            if target <= position {
                let rewind = position - target;
                let rewindable =
                    (buffer.bytes_free() as u64).min(position.saturating_sub(state.reset_origin));
                if rewind <= rewindable {
                    self.adjust_in_place(state, buffer, target);
                    return false;
                }
            } else if target < buffered_end {
                self.adjust_in_place(state, buffer, target);
                return false;
            } else if buffer.bytes_available() == 0 {
                if state.request_block <= self.target_block {
                    // Block not requested yet and nothing to discard.
                    debug!("Seek to {} waits for unrequested current block", target);
                    return false;
                }
                if self.in_flight(state) {
                    debug!("Seek to {} waits for in-flight current block", target);
                    self.requested = true;
                    return false;
                }
            }
        } else if self.target_block > current_block {
            if target < buffered_end {
                self.adjust_in_place(state, buffer, target);
                return false;
            }
            if self.target_block >= buffered_end && self.target_block < state.request_block {
                debug!("Seek to {} waits for requested block {}", target, self.target_block);
                self.requested = true;
                return false;
            }
        }

        self.hard_reset(state, buffer);
        true
    }

    /// Whether the target block was requested by the live window and has not
    /// arrived yet.
    fn in_flight(&self, state: &SessionState) -> bool {
        state.current_window_size > 0
            && state.request_block > self.target_block
            && state
                .last_block_buffered
                .is_none_or(|block| block < self.target_block)
    }

    fn adjust_in_place(
        &mut self,
        state: &mut SessionState,
        buffer: &mut CircularBuffer,
        target: u64,
    ) {
        let delta = target as i64 - state.stream_position as i64;
        buffer.adjust_bytes(delta);
        state.stream_position = target;
        self.seeking = false;
        self.requested = false;
    }

    fn hard_reset(&mut self, state: &mut SessionState, buffer: &mut CircularBuffer) {
        debug!(
            "Hard reset seek from {} to {}, abandoning {} requests",
            state.stream_position,
            self.target(),
            state.current_window_size
        );
        buffer.reset();
        state.abandon_window();
        state.last_block_buffered = None;
        state.reset_origin = self.target_block;
        self.requested = false;
    }

    /// Points the request cursor at the target when it has not been asked for.
    pub fn process_requests(&mut self, state: &mut SessionState) {
        if self.seeking && !self.requested {
            state.request_block = self.target_block;
            state.abandon_window();
            self.requested = true;
        }
    }

    /// Completes the seek when `block_offset` is the target block.
    ///
    /// Refills the buffer from `payload`, skips the intra-block remainder and
    /// snaps the stream position. Returns false for any other block, which the
    /// caller discards.
    pub fn postprocess_seek(
        &mut self,
        state: &mut SessionState,
        buffer: &mut CircularBuffer,
        block_offset: u64,
        payload: &[u8],
    ) -> bool {
        if !self.seeking || !self.requested || block_offset != self.target_block {
            return false;
        }

        // A short final block can end before the remainder.
        let skip = self.block_remainder.min(payload.len() as u64);
        buffer.reset();
        buffer.write_bytes(payload);
        buffer.adjust_bytes(skip as i64);
        state.stream_position = self.target_block + skip;
        state.reset_origin = self.target_block;
        state.last_block_buffered = Some(block_offset);
        self.seeking = false;
        self.requested = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const BLOCK: usize = 1024;

    /// Buffer holding blocks `[first, first + count)` with the reader at `position`.
    fn buffered(
        first: u64,
        count: u64,
        position: u64,
        requested_to: u64,
    ) -> (SessionState, CircularBuffer) {
        let mut state = SessionState::new(BLOCK);
        let mut buffer = CircularBuffer::new(BLOCK * 16);
        for block in first..first + count {
            assert!(buffer.write_bytes(&[block as u8; BLOCK]));
        }
        state.reset_origin = first * BLOCK as u64;
        state.stream_position = first * BLOCK as u64;
        buffer.adjust_bytes((position - state.stream_position) as i64);
        state.stream_position = position;
        state.request_block = requested_to * BLOCK as u64;
        state.current_window_size = (requested_to - first - count) as usize;
        state.last_block_buffered = Some((first + count - 1) * BLOCK as u64);
        (state, buffer)
    }

    #[test]
    fn test_same_block_seek_adjusts_cursor() {
        let (mut state, mut buffer) = buffered(0, 4, 1500, 6);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(1100);
        assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
        assert!(!seeker.is_seeking());
        assert_eq!(state.stream_position, 1100);

        let mut byte = [0u8; 1];
        buffer.read_bytes(&mut byte);
        assert_eq!(byte[0], 1);
    }

    /// Empty buffer with the reader at the start of block `current`, whose
    /// request is still outstanding along with those up to `requested_to`.
    fn drained(current: u64, requested_to: u64) -> (SessionState, CircularBuffer) {
        let mut state = SessionState::new(BLOCK);
        state.stream_position = current * BLOCK as u64;
        state.reset_origin = current * BLOCK as u64;
        state.request_block = requested_to * BLOCK as u64;
        state.current_window_size = (requested_to - current) as usize;
        state.last_block_buffered = current.checked_sub(1).map(|block| block * BLOCK as u64);
        (state, CircularBuffer::new(BLOCK * 16))
    }

    #[test]
    fn test_same_block_seek_waits_for_in_flight_block() {
        let (mut state, mut buffer) = drained(4, 6);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(4 * BLOCK as u64 + 10);
        assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
        assert!(seeker.is_seeking());
        assert!(seeker.is_requested());
        assert_eq!(state.current_window_size, 2);
        assert_eq!(state.stale_responses, 0);

        seeker.process_requests(&mut state);
        assert_eq!(state.request_block, 6 * BLOCK as u64);

        let block4 = [4u8; BLOCK];
        assert!(seeker.postprocess_seek(&mut state, &mut buffer, 4 * BLOCK as u64, &block4));
        assert_eq!(state.stream_position, 4 * BLOCK as u64 + 10);
        assert_eq!(buffer.bytes_available(), BLOCK - 10);
    }

    #[test]
    fn test_forward_seek_within_buffer_skips_ahead() {
        let (mut state, mut buffer) = buffered(0, 4, 100, 6);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(3 * BLOCK as u64 + 10);
        assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
        assert!(!seeker.is_seeking());
        assert_eq!(buffer.bytes_available(), BLOCK - 10);

        let mut byte = [0u8; 1];
        buffer.read_bytes(&mut byte);
        assert_eq!(byte[0], 3);
    }

    #[test]
    fn test_seek_into_requested_window_waits() {
        let (mut state, mut buffer) = buffered(0, 4, 100, 6);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(5 * BLOCK as u64 + 7);
        assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
        assert!(seeker.is_seeking());
        assert!(seeker.is_requested());
        assert_eq!(state.current_window_size, 2);

        let block4 = [4u8; BLOCK];
        assert!(!seeker.postprocess_seek(&mut state, &mut buffer, 4 * BLOCK as u64, &block4));

        let block5 = [5u8; BLOCK];
        assert!(seeker.postprocess_seek(&mut state, &mut buffer, 5 * BLOCK as u64, &block5));
        assert_eq!(state.stream_position, 5 * BLOCK as u64 + 7);
        assert_eq!(buffer.bytes_available(), BLOCK - 7);
        assert!(!seeker.is_seeking());
    }

    #[test]
    fn test_beyond_window_seek_hard_resets() {
        let (mut state, mut buffer) = buffered(0, 4, 100, 6);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(40 * BLOCK as u64);
        assert!(seeker.preprocess_seek(&mut state, &mut buffer));
        assert_eq!(state.current_window_size, 0);
        assert_eq!(state.stale_responses, 2);
        assert_eq!(buffer.bytes_available(), 0);

        seeker.process_requests(&mut state);
        assert_eq!(state.request_block, 40 * BLOCK as u64);
        assert!(seeker.is_requested());
    }

    #[test]
    fn test_backward_seek_to_earlier_block_hard_resets() {
        let (mut state, mut buffer) = buffered(4, 4, 6 * BLOCK as u64, 10);
        let mut seeker = Seeker::new(BLOCK);

        seeker.init_seek(2 * BLOCK as u64);
        assert!(seeker.preprocess_seek(&mut state, &mut buffer));
        assert_eq!(buffer.bytes_available(), 0);
    }

    proptest! {
        #[test]
        fn prop_same_block_seek_never_hard_resets(
            first in 0u64..8,
            count in 1u64..6,
            position_seed in any::<u64>(),
            target_seed in any::<u64>(),
        ) {
            let block = BLOCK as u64;
            let start = first * block;
            let end = (first + count) * block;
            let position = start + position_seed % (end - start);
            let (mut state, mut buffer) = buffered(first, count, position, first + count);

            let current_block = position / block * block;
            let target = current_block + target_seed % block;

            let mut seeker = Seeker::new(BLOCK);
            seeker.init_seek(target);
            prop_assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
            prop_assert!(!seeker.is_seeking());
            prop_assert_eq!(state.stream_position, target);
            prop_assert_eq!(state.buffered_end(buffer.bytes_available()), end);
        }

        #[test]
        fn prop_same_block_seek_keeps_in_flight_window(
            current in 0u64..8,
            ahead in 1u64..6,
            target_seed in any::<u64>(),
        ) {
            let block = BLOCK as u64;
            let (mut state, mut buffer) = drained(current, current + ahead);
            let target = current * block + target_seed % block;

            let mut seeker = Seeker::new(BLOCK);
            seeker.init_seek(target);
            prop_assert!(!seeker.preprocess_seek(&mut state, &mut buffer));
            prop_assert_eq!(state.current_window_size, ahead as usize);
            prop_assert_eq!(state.stale_responses, 0);

            if seeker.is_seeking() {
                let payload = vec![current as u8; BLOCK];
                let landed =
                    seeker.postprocess_seek(&mut state, &mut buffer, current * block, &payload);
                prop_assert!(landed);
            }
            prop_assert_eq!(state.stream_position, target);
        }
    }
}
