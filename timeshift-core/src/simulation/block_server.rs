//! Block-window protocol server over in-memory pipes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use super::{SharedState, SimulatedDvr};
use crate::timeshift::ring::protocol::{BlockHeader, BlockRequest, REQUEST_LEN, decode_open};
use crate::transport::{BlockConnector, BoxedSocket, TransportError, TransportResult};

/// In-memory pipe capacity per direction.
const PIPE_CAPACITY: usize = 1 << 20;

/// How often a request for unwritten data re-checks the live stream.
const DATA_POLL: Duration = Duration::from_millis(20);

/// Connector whose every connection is served by an in-process task.
pub struct SimulatedBlockServer {
    state: SharedState,
}

impl SimulatedBlockServer {
    pub(crate) fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl BlockConnector for SimulatedBlockServer {
    async fn connect(&self) -> TransportResult<BoxedSocket> {
        {
            let mut state = self.state.lock();
            if state.offline || state.block_connect_fails {
                return Err(TransportError::Connect {
                    target: "sim-block-server".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            state.stats.block_connections += 1;
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(state, server).await {
                debug!("Simulated block connection ended: {}", e);
            }
        });
        Ok(Box::new(client))
    }
}

async fn serve_connection(state: SharedState, socket: DuplexStream) -> std::io::Result<()> {
    let (reader, mut writer) = tokio::io::split(socket);
    let mut reader = BufReader::new(reader);

    let mut open = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line == "\r\n" {
            break;
        }
        open.push_str(&line);
    }
    let stream = decode_open(&open)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    debug!("Simulated block server streaming {}", stream);

    let pending = Arc::new(AtomicUsize::new(0));
    let client_gone = Arc::new(AtomicBool::new(false));
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();

    {
        let state = Arc::clone(&state);
        let pending = Arc::clone(&pending);
        let client_gone = Arc::clone(&client_gone);
        tokio::spawn(async move {
            let mut frame = [0u8; REQUEST_LEN];
            let mut requested = HashSet::new();
            while reader.read_exact(&mut frame).await.is_ok() {
                let Ok(request) = BlockRequest::decode(&frame) else {
                    break;
                };
                let outstanding = pending.fetch_add(1, Ordering::SeqCst) + 1;
                {
                    let mut state = state.lock();
                    state.stats.max_outstanding = state.stats.max_outstanding.max(outstanding);
                    if !requested.insert(request.offset) {
                        state.stats.repeated_requests += 1;
                    }
                }
                if requests_tx.send(request).is_err() {
                    break;
                }
            }
            client_gone.store(true, Ordering::SeqCst);
        });
    }

    let mut payload = Vec::new();
    while let Some(request) = requests_rx.recv().await {
        let Some(total) = wait_for_block(&state, &request, &client_gone).await else {
            break;
        };
        let size = request.length.min(total.saturating_sub(request.offset));
        let header = BlockHeader {
            offset: request.offset,
            size,
            total,
            reserved: 0,
        };
        payload.resize(size as usize, 0);
        SimulatedDvr::fill_pattern(request.offset, &mut payload);

        pending.fetch_sub(1, Ordering::SeqCst);
        writer.write_all(&header.encode()).await?;
        writer.write_all(&payload).await?;
    }
    Ok(())
}

/// Waits until the whole block exists or the stream finished, returning the
/// live length. `None` once the client disconnected.
async fn wait_for_block(
    state: &SharedState,
    request: &BlockRequest,
    client_gone: &AtomicBool,
) -> Option<u64> {
    loop {
        let (length, complete) = {
            let state = state.lock();
            (state.live.length(), state.live.is_complete())
        };
        if complete || request.offset + request.length <= length {
            return Some(length);
        }
        if client_gone.load(Ordering::SeqCst) {
            return None;
        }
        tokio::time::sleep(DATA_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeshift::ring::protocol::{HEADER_LEN, encode_open};

    #[tokio::test(start_paused = true)]
    async fn test_answers_requests_in_order() {
        let dvr = SimulatedDvr::new();
        dvr.set_live(10_000, 0);
        let mut socket = dvr.block_server().connect().await.unwrap();
        socket
            .write_all(&encode_open("sim://live/1", "client", "sid"))
            .await
            .unwrap();

        for (sequence, offset) in [(1, 0u64), (2, 4_096)] {
            let request = BlockRequest {
                offset,
                length: 4_096,
                sequence,
            };
            socket.write_all(&request.encode()).await.unwrap();
        }

        for offset in [0u64, 4_096] {
            let mut frame = [0u8; HEADER_LEN];
            socket.read_exact(&mut frame).await.unwrap();
            let header = BlockHeader::decode(&frame).unwrap();
            assert_eq!(header.offset, offset);
            assert_eq!(header.size, 4_096);
            assert_eq!(header.total, 10_000);

            let mut payload = vec![0u8; 4_096];
            socket.read_exact(&mut payload).await.unwrap();
            assert!(SimulatedDvr::verify_pattern(offset, &payload));
        }
        assert_eq!(dvr.stats().block_connections, 1);
        assert!(dvr.stats().max_outstanding <= 2);
        assert_eq!(dvr.stats().repeated_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_block_at_end_of_finished_stream() {
        let dvr = SimulatedDvr::new();
        dvr.set_live(5_000, 0);
        dvr.set_live_complete();
        let mut socket = dvr.block_server().connect().await.unwrap();
        socket
            .write_all(&encode_open("sim://live/1", "client", "sid"))
            .await
            .unwrap();
        let request = BlockRequest {
            offset: 4_096,
            length: 4_096,
            sequence: 1,
        };
        socket.write_all(&request.encode()).await.unwrap();

        let mut frame = [0u8; HEADER_LEN];
        socket.read_exact(&mut frame).await.unwrap();
        assert_eq!(BlockHeader::decode(&frame).unwrap().size, 904);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_when_told_to() {
        let dvr = SimulatedDvr::new();
        dvr.fail_block_connections(true);
        assert!(matches!(
            dvr.block_server().connect().await,
            Err(TransportError::Connect { .. })
        ));
    }
}
