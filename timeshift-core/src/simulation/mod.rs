//! In-process DVR backend for deterministic testing.
//!
//! [`SimulatedDvr`] holds one live stream, any number of named files and a
//! rotating segment list, and hands out the three seams every buffer
//! strategy depends on:
//!
//! - [`SimulatedBackend`] answers control-plane calls
//! - [`SimulatedTransport`] serves ranged reads with seeded short reads
//! - [`SimulatedBlockServer`] speaks the block-window protocol over
//!   `tokio::io::duplex`
//!
//! Every byte at logical offset `n` equals [`SimulatedDvr::pattern_byte`]`(n)`
//! so readers can verify what they received. The live stream grows with the
//! tokio clock, which makes paused-time tests advance it deterministically.
//!
//! ```rust,no_run
//! use timeshift_core::config::TimeshiftConfig;
//! use timeshift_core::simulation::SimulatedDvr;
//! use timeshift_core::timeshift::{RingTimeshift, TimeshiftBuffer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dvr = SimulatedDvr::new();
//! dvr.set_live(1_000_000, 250_000);
//! let buffer = RingTimeshift::new(dvr.context(TimeshiftConfig::for_testing()));
//! buffer.open("sim://live/7").await?;
//! let mut chunk = vec![0u8; 4096];
//! let read = buffer.read(&mut chunk).await;
//! assert!(SimulatedDvr::verify_pattern(buffer.position() - read as u64, &chunk[..read]));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod block_server;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use backend::SimulatedBackend;
pub use block_server::SimulatedBlockServer;
use parking_lot::Mutex;
use tokio::time::Instant;
pub use transport::SimulatedTransport;

use crate::backend::{LeaseKind, SegmentRecord};
use crate::config::TimeshiftConfig;
use crate::timeshift::StreamContext;

/// Seed for the transport's short-read generator.
pub const DEFAULT_SEED: u64 = 0x5EED_7153;

/// Live stream that grows at a fixed byte rate.
#[derive(Debug, Clone)]
pub(crate) struct LiveSource {
    base_length: u64,
    bytes_per_second: u64,
    since: Instant,
    complete: bool,
}

impl LiveSource {
    fn new(length: u64, bytes_per_second: u64) -> Self {
        Self {
            base_length: length,
            bytes_per_second,
            since: Instant::now(),
            complete: false,
        }
    }

    pub(crate) fn length(&self) -> u64 {
        if self.complete {
            return self.base_length;
        }
        let grown = self.since.elapsed().as_secs_f64() * self.bytes_per_second as f64;
        self.base_length + grown as u64
    }

    /// Freezes the current growth into `base_length`.
    fn settle(&mut self) {
        self.base_length = self.length();
        self.since = Instant::now();
    }

    pub(crate) fn duration(&self) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.length() as f64 / self.bytes_per_second as f64)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }
}

/// A named file served under `sim://{name}`.
#[derive(Debug, Clone)]
pub(crate) struct SimFile {
    pub(crate) length: u64,
    /// Appended to while playing
    pub(crate) growing: bool,
}

/// Scripted behaviour of remote transcodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct TranscodeScript {
    /// Status polls answered with `Preparing` before `Ready`
    pub(crate) ready_after: u32,
    pub(crate) fail: bool,
    pub(crate) polls: u32,
}

/// Counters of what strategies asked the simulated backend to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub stream_starts: u32,
    pub stream_stops: u32,
    pub stream_info_calls: u32,
    pub stream_leases: u32,
    pub transcode_leases: u32,
    pub transcode_starts: u32,
    pub transcode_stops: u32,
    pub block_connections: u32,
    /// Most block requests the server held unanswered at once
    pub max_outstanding: usize,
    /// Requests for a block already asked for on the same connection
    pub repeated_requests: u32,
    pub transport_opens: u32,
    /// Readers opened and not yet dropped
    pub open_readers: u32,
}

impl SimStats {
    pub fn leases(&self, kind: LeaseKind) -> u32 {
        match kind {
            LeaseKind::Stream => self.stream_leases,
            LeaseKind::Transcode => self.transcode_leases,
        }
    }
}

/// Segment layout of the rolling-file stream.
#[derive(Debug, Clone)]
pub(crate) enum SegmentLayout {
    /// Exactly these records
    Fixed(Vec<SegmentRecord>),
    /// A new file every `size` bytes of the live stream
    Every(u64),
}

#[derive(Debug)]
pub(crate) struct DvrState {
    pub(crate) live: LiveSource,
    pub(crate) files: HashMap<String, SimFile>,
    pub(crate) segments: SegmentLayout,
    pub(crate) epg_rollover: bool,
    pub(crate) offline: bool,
    pub(crate) stream_info_failures: u32,
    pub(crate) lease_failures: u32,
    pub(crate) block_connect_fails: bool,
    pub(crate) transcode: TranscodeScript,
    pub(crate) stats: SimStats,
}

impl DvrState {
    fn new() -> Self {
        Self {
            live: LiveSource::new(0, 0),
            files: HashMap::new(),
            segments: SegmentLayout::Every(1 << 20),
            epg_rollover: false,
            offline: false,
            stream_info_failures: 0,
            lease_failures: 0,
            block_connect_fails: false,
            transcode: TranscodeScript::default(),
            stats: SimStats::default(),
        }
    }

    /// Segment records the backend currently reports, oldest first.
    pub(crate) fn segment_records(&self) -> Vec<SegmentRecord> {
        match &self.segments {
            SegmentLayout::Fixed(records) => records.clone(),
            SegmentLayout::Every(size) => {
                let size = (*size).max(1);
                let length = self.live.length();
                let count = length / size + 1;
                (0..count)
                    .map(|index| SegmentRecord::new(format!("seg-{index:05}.ts"), index * size))
                    .collect()
            }
        }
    }

    /// Logical start offset and current end of a segment file.
    pub(crate) fn segment_bounds(&self, filename: &str) -> Option<(u64, u64)> {
        let records = self.segment_records();
        let index = records.iter().position(|record| record.filename == filename)?;
        let start = records[index].offset;
        let end = records
            .get(index + 1)
            .map_or_else(|| self.live.length(), |next| next.offset);
        Some((start, end.max(start)))
    }
}

pub(crate) type SharedState = Arc<Mutex<DvrState>>;

/// Simulated DVR backend with byte-pattern content.
#[derive(Clone)]
pub struct SimulatedDvr {
    state: SharedState,
    seed: u64,
}

impl SimulatedDvr {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// DVR whose transport short reads follow `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DvrState::new())),
            seed,
        }
    }

    /// Byte stored at logical offset `offset` of every simulated stream.
    pub fn pattern_byte(offset: u64) -> u8 {
        (offset % 251) as u8
    }

    /// Whether `data` is exactly the content starting at `offset`.
    pub fn verify_pattern(offset: u64, data: &[u8]) -> bool {
        data.iter()
            .enumerate()
            .all(|(index, byte)| *byte == Self::pattern_byte(offset + index as u64))
    }

    /// Fills `buf` with the content starting at `offset`.
    pub fn fill_pattern(offset: u64, buf: &mut [u8]) {
        for (index, byte) in buf.iter_mut().enumerate() {
            *byte = Self::pattern_byte(offset + index as u64);
        }
    }

    pub fn backend(&self) -> Arc<SimulatedBackend> {
        Arc::new(SimulatedBackend::new(Arc::clone(&self.state)))
    }

    pub fn transport(&self) -> Arc<SimulatedTransport> {
        Arc::new(SimulatedTransport::new(Arc::clone(&self.state), self.seed))
    }

    pub fn block_server(&self) -> Arc<SimulatedBlockServer> {
        Arc::new(SimulatedBlockServer::new(Arc::clone(&self.state)))
    }

    /// Stream context wired entirely to this DVR.
    pub fn context(&self, config: TimeshiftConfig) -> StreamContext {
        StreamContext::new(config, self.backend(), self.transport(), self.block_server())
    }

    /// Restarts the live stream at `length` bytes growing by `bytes_per_second`.
    pub fn set_live(&self, length: u64, bytes_per_second: u64) {
        self.state.lock().live = LiveSource::new(length, bytes_per_second);
    }

    /// Appends `bytes` to the live stream immediately.
    pub fn append_live(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.live.settle();
        state.live.base_length += bytes;
    }

    /// Marks the live stream finished at its current length.
    pub fn set_live_complete(&self) {
        let mut state = self.state.lock();
        state.live.settle();
        state.live.complete = true;
    }

    pub fn live_length(&self) -> u64 {
        self.state.lock().live.length()
    }

    /// Adds a finished file served at `sim://{name}`.
    pub fn add_file(&self, name: &str, length: u64) {
        self.state.lock().files.insert(
            name.to_string(),
            SimFile {
                length,
                growing: false,
            },
        );
    }

    /// Adds a file that is still being written.
    pub fn add_growing_file(&self, name: &str, length: u64) {
        self.state.lock().files.insert(
            name.to_string(),
            SimFile {
                length,
                growing: true,
            },
        );
    }

    /// Appends to a named file. Unknown names are ignored.
    pub fn append_file(&self, name: &str, bytes: u64) {
        if let Some(file) = self.state.lock().files.get_mut(name) {
            file.length += bytes;
        }
    }

    pub fn file_length(&self, name: &str) -> Option<u64> {
        self.state.lock().files.get(name).map(|file| file.length)
    }

    /// Reports exactly `records` as the rolling-file segment list.
    pub fn set_segments(&self, records: Vec<SegmentRecord>) {
        self.state.lock().segments = SegmentLayout::Fixed(records);
    }

    /// Rotates to a new segment file every `size` bytes of the live stream.
    pub fn set_segment_size(&self, size: u64) {
        self.state.lock().segments = SegmentLayout::Every(size);
    }

    pub fn set_epg_rollover(&self, enabled: bool) {
        self.state.lock().epg_rollover = enabled;
    }

    /// Makes every control call and transport open fail to connect.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fails the next `count` stream info polls with a malformed response.
    pub fn fail_stream_info(&self, count: u32) {
        self.state.lock().stream_info_failures = count;
    }

    /// Fails the next `count` lease renewals.
    pub fn fail_leases(&self, count: u32) {
        self.state.lock().lease_failures = count;
    }

    /// Transcodes report `Ready` after `ready_after` status polls, or
    /// `Failed` on the first poll when `fail` is set.
    pub fn script_transcode(&self, ready_after: u32, fail: bool) {
        self.state.lock().transcode = TranscodeScript {
            ready_after,
            fail,
            polls: 0,
        };
    }

    /// Refuses block-protocol connections.
    pub fn fail_block_connections(&self, fail: bool) {
        self.state.lock().block_connect_fails = fail;
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }
}

impl Default for SimulatedDvr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_verification() {
        let mut buf = [0u8; 600];
        SimulatedDvr::fill_pattern(1_000, &mut buf);
        assert!(SimulatedDvr::verify_pattern(1_000, &buf));
        assert!(!SimulatedDvr::verify_pattern(1_001, &buf));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stream_grows_with_clock() {
        let dvr = SimulatedDvr::new();
        dvr.set_live(1_000, 500);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(dvr.live_length(), 2_000);

        dvr.set_live_complete();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(dvr.live_length(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_segment_size_layout() {
        let dvr = SimulatedDvr::new();
        dvr.set_live(2_500, 0);
        dvr.set_segment_size(1_000);

        let state = dvr.state.lock();
        let records = state.segment_records();
        let offsets: Vec<u64> = records.iter().map(|record| record.offset).collect();
        assert_eq!(offsets, vec![0, 1_000, 2_000]);
        assert_eq!(state.segment_bounds(&records[1].filename), Some((1_000, 2_000)));
        assert_eq!(state.segment_bounds(&records[2].filename), Some((2_000, 2_500)));
    }
}
