//! Control plane of the simulated DVR.

use async_trait::async_trait;
use tracing::debug;

use super::SharedState;
use crate::backend::{
    Backend, BackendError, BackendResult, Capabilities, LeaseKind, StreamInfo, TranscodeStatus,
};
use crate::network::NetworkError;

/// Answers control calls from the shared [`super::DvrState`].
pub struct SimulatedBackend {
    state: SharedState,
}

impl SimulatedBackend {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }

    fn check_online(&self, stream: &str) -> BackendResult<()> {
        if self.state.lock().offline {
            return Err(BackendError::Network(NetworkError::Connect {
                url: stream.to_string(),
            }));
        }
        Ok(())
    }

    fn known(&self, stream: &str) -> bool {
        match stream.strip_prefix("sim://") {
            Some(path) if path.starts_with("live/") => true,
            Some(path) => self.state.lock().files.contains_key(path),
            None => false,
        }
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn capabilities(&self) -> BackendResult<Capabilities> {
        self.check_online("capabilities")?;
        Ok(Capabilities {
            epg_rollover: self.state.lock().epg_rollover,
            ranged_streams: true,
        })
    }

    async fn start_stream(&self, stream: &str) -> BackendResult<()> {
        self.check_online(stream)?;
        if !self.known(stream) {
            return Err(BackendError::NotFound {
                stream: stream.to_string(),
            });
        }
        self.state.lock().stats.stream_starts += 1;
        debug!("Simulation: started stream {}", stream);
        Ok(())
    }

    async fn stop_stream(&self, stream: &str) -> BackendResult<()> {
        self.check_online(stream)?;
        self.state.lock().stats.stream_stops += 1;
        debug!("Simulation: stopped stream {}", stream);
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> BackendResult<StreamInfo> {
        self.check_online(stream)?;
        let mut state = self.state.lock();
        state.stats.stream_info_calls += 1;
        if state.stream_info_failures > 0 {
            state.stream_info_failures -= 1;
            return Err(BackendError::Malformed {
                method: "channel.stream.info".to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let path = stream.strip_prefix("sim://").unwrap_or(stream);
        if let Some(file) = state.files.get(path) {
            return Ok(StreamInfo {
                length: file.length,
                duration: std::time::Duration::ZERO,
                complete: !file.growing,
                segments: Vec::new(),
            });
        }
        if !path.starts_with("live/") {
            return Err(BackendError::NotFound {
                stream: stream.to_string(),
            });
        }

        Ok(StreamInfo {
            length: state.live.length(),
            duration: state.live.duration(),
            complete: state.live.is_complete(),
            segments: state.segment_records(),
        })
    }

    fn segment_url(&self, _stream: &str, filename: &str) -> String {
        format!("sim://segment/{filename}")
    }

    async fn start_transcode(&self, stream: &str, profile: &str) -> BackendResult<()> {
        self.check_online(stream)?;
        let mut state = self.state.lock();
        state.stats.transcode_starts += 1;
        state.transcode.polls = 0;
        debug!("Simulation: transcoding {} with profile {}", stream, profile);
        Ok(())
    }

    async fn transcode_status(&self, stream: &str) -> BackendResult<TranscodeStatus> {
        self.check_online(stream)?;
        let mut state = self.state.lock();
        let script = &mut state.transcode;
        if script.fail {
            return Ok(TranscodeStatus::Failed);
        }
        script.polls += 1;
        if script.polls > script.ready_after {
            return Ok(TranscodeStatus::Ready);
        }
        let percent = script.polls * 100 / (script.ready_after + 1);
        Ok(TranscodeStatus::Preparing(percent.min(99) as u8))
    }

    fn transcode_url(&self, stream: &str) -> String {
        let path = stream.strip_prefix("sim://").unwrap_or(stream);
        format!("sim://transcode/{path}")
    }

    async fn stop_transcode(&self, stream: &str) -> BackendResult<()> {
        self.check_online(stream)?;
        self.state.lock().stats.transcode_stops += 1;
        Ok(())
    }

    async fn lease(&self, stream: &str, kind: LeaseKind) -> BackendResult<()> {
        self.check_online(stream)?;
        let mut state = self.state.lock();
        if state.lease_failures > 0 {
            state.lease_failures -= 1;
            return Err(BackendError::Rejected {
                method: kind.method().to_string(),
                message: "injected failure".to_string(),
            });
        }
        match kind {
            LeaseKind::Stream => state.stats.stream_leases += 1,
            LeaseKind::Transcode => state.stats.transcode_leases += 1,
        }
        Ok(())
    }
}
