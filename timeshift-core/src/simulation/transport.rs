//! Ranged reads over the simulated DVR's content.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SharedState, SimulatedDvr};
use crate::transport::{MediaReader, MediaTransport, TransportError, TransportResult};

/// What a URL resolves to.
#[derive(Debug, Clone)]
enum Source {
    /// The live stream, or a transcode of it
    Live,
    /// A named file; its bytes start the pattern at zero
    File(String),
    /// A segment file whose first byte is at this logical offset
    Segment { filename: String, start: u64 },
}

/// Serves `sim://` URLs with deterministic short reads.
pub struct SimulatedTransport {
    state: SharedState,
    seed: u64,
}

impl SimulatedTransport {
    pub(crate) fn new(state: SharedState, seed: u64) -> Self {
        Self { state, seed }
    }

    fn resolve(&self, url: &str) -> TransportResult<Source> {
        let not_found = || TransportError::NotFound {
            url: url.to_string(),
        };
        let path = url.strip_prefix("sim://").ok_or_else(not_found)?;
        let state = self.state.lock();

        if path.starts_with("live/") || path.starts_with("transcode/") {
            return Ok(Source::Live);
        }
        if let Some(filename) = path.strip_prefix("segment/") {
            let (start, _) = state.segment_bounds(filename).ok_or_else(not_found)?;
            return Ok(Source::Segment {
                filename: filename.to_string(),
                start,
            });
        }
        if state.files.contains_key(path) {
            return Ok(Source::File(path.to_string()));
        }
        Err(not_found())
    }
}

#[async_trait]
impl MediaTransport for SimulatedTransport {
    async fn open(&self, url: &str, offset: u64) -> TransportResult<Box<dyn MediaReader>> {
        if self.state.lock().offline {
            return Err(TransportError::Connect {
                target: url.to_string(),
                reason: "simulated backend offline".to_string(),
            });
        }
        let source = self.resolve(url)?;
        {
            let mut state = self.state.lock();
            state.stats.transport_opens += 1;
            state.stats.open_readers += 1;
        }
        tracing::debug!("Simulation: opened {} at {}", url, offset);
        Ok(Box::new(SimulatedReader {
            state: self.state.clone(),
            source,
            position: offset,
            rng: ChaCha8Rng::seed_from_u64(self.seed ^ offset),
        }))
    }
}

struct SimulatedReader {
    state: SharedState,
    source: Source,
    position: u64,
    rng: ChaCha8Rng,
}

impl SimulatedReader {
    /// Current end of the resource and the logical offset of its first byte.
    fn bounds(&self) -> TransportResult<(u64, u64)> {
        let state = self.state.lock();
        match &self.source {
            Source::Live => Ok((state.live.length(), 0)),
            Source::File(name) => state
                .files
                .get(name)
                .map(|file| (file.length, 0))
                .ok_or_else(|| TransportError::NotFound { url: name.clone() }),
            Source::Segment { filename, start } => {
                let end = state
                    .segment_bounds(filename)
                    .map_or(0, |(_, end)| end.saturating_sub(*start));
                Ok((end, *start))
            }
        }
    }
}

impl Drop for SimulatedReader {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.stats.open_readers = state.stats.open_readers.saturating_sub(1);
    }
}

#[async_trait]
impl MediaReader for SimulatedReader {
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        let (end, base) = self.bounds()?;
        if buf.is_empty() || self.position >= end {
            return Ok(0);
        }

        let remaining = (end - self.position).min(buf.len() as u64) as usize;
        let count = self.rng.random_range(1..=remaining);
        SimulatedDvr::fill_pattern(base + self.position, &mut buf[..count]);
        self.position += count as u64;
        tokio::task::yield_now().await;
        Ok(count)
    }

    async fn seek(&mut self, position: u64) -> TransportResult<u64> {
        if !self.is_seekable() {
            return Err(TransportError::NotSeekable);
        }
        self.position = position;
        Ok(position)
    }

    fn length(&self) -> Option<u64> {
        match &self.source {
            Source::Live => None,
            _ => self.bounds().ok().map(|(end, _)| end),
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_seekable(&self) -> bool {
        !matches!(self.source, Source::Live)
    }
}
