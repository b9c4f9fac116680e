//! Block-window timeshift against the simulated DVR.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use timeshift_core::config::{StreamingMethod, TimeshiftConfig};
use timeshift_core::simulation::SimulatedDvr;
use timeshift_core::timeshift::{RingTimeshift, StreamState, TimeshiftBuffer};
use tokio::time::Instant;

const LIVE: &str = "sim://live/7";

fn ring_config() -> TimeshiftConfig {
    let mut config = TimeshiftConfig::for_testing();
    config.streaming.method = StreamingMethod::Timeshift;
    config.ring.block_size = 32768;
    config.ring.window_size = 6;
    config
}

#[tokio::test(start_paused = true)]
async fn test_steady_playback_is_contiguous() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(buffer.state(), StreamState::Active);
    assert!(buffer.is_real_time_stream());

    let mut chunk = [0u8; 4096];
    let mut expected = 0u64;
    for _ in 0..5 {
        assert_eq!(buffer.read(&mut chunk).await, 4096);
        assert!(SimulatedDvr::verify_pattern(expected, &chunk));
        expected += 4096;
        assert_eq!(buffer.position(), expected);
    }
    assert_eq!(buffer.length(), 10_000_000);

    buffer.close().await;
    assert_eq!(buffer.state(), StreamState::Closed);
    let stats = dvr.stats();
    assert_eq!(stats.stream_starts, 1);
    assert_eq!(stats.stream_stops, 1);
    assert_eq!(stats.block_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_outstanding_requests_stay_within_window() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    let config = ring_config();
    let window = config.ring.window_size;
    let buffer = RingTimeshift::new(dvr.context(config));
    buffer.open(LIVE).await.unwrap();

    let mut chunk = vec![0u8; 65536];
    let mut position = 0u64;
    while position < 2_000_000 {
        let count = buffer.read(&mut chunk).await;
        assert!(count > 0);
        assert!(SimulatedDvr::verify_pattern(position, &chunk[..count]));
        position += count as u64;
    }

    let max = dvr.stats().max_outstanding;
    assert!(max > 0);
    assert!(max <= window, "{max} requests outstanding with a window of {window}");
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_beyond_window_refills_from_target() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();

    assert_eq!(buffer.seek(SeekFrom::Start(5_000_000)).await, Some(5_000_000));
    assert_eq!(buffer.position(), 5_000_000);

    let mut chunk = [0u8; 4096];
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    assert!(SimulatedDvr::verify_pattern(5_000_000, &chunk));

    // Back within the block just read.
    assert_eq!(buffer.seek(SeekFrom::Current(-1000)).await, Some(5_003_096));
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    assert!(SimulatedDvr::verify_pattern(5_003_096, &chunk));

    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_completion_halts_retry_and_clamps_seeks() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(100_000, 0);
    dvr.set_live_complete();
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    for _ in 0..100 {
        let count = buffer.read(&mut chunk).await;
        if count == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..count]);
    }
    assert_eq!(received.len(), 100_000);
    assert!(SimulatedDvr::verify_pattern(0, &received));
    assert!(buffer.is_complete());
    assert!(!buffer.is_real_time_stream());

    let before = Instant::now();
    assert_eq!(buffer.read(&mut chunk).await, 0);
    assert!(before.elapsed() < Duration::from_millis(500));

    assert_eq!(buffer.seek(SeekFrom::End(1_000)).await, Some(100_000));
    assert_eq!(buffer.seek(SeekFrom::Start(250_000)).await, Some(100_000));

    assert_eq!(buffer.seek(SeekFrom::Start(50_000)).await, Some(50_000));
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    assert!(SimulatedDvr::verify_pattern(50_000, &chunk));

    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_to_end_of_block_aligned_finished_stream() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(4 * 32768, 0);
    dvr.set_live_complete();
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();

    let mut chunk = [0u8; 4096];
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(buffer.is_complete());

    let landed = tokio::time::timeout(Duration::from_secs(5), buffer.seek(SeekFrom::End(0)))
        .await
        .expect("seek to the end returns");
    assert_eq!(landed, Some(131_072));
    let before = Instant::now();
    assert_eq!(buffer.read(&mut chunk).await, 0);
    assert!(before.elapsed() < Duration::from_millis(500));

    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_to_end_beyond_buffered_data_then_back() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(64 * 32768, 0);
    dvr.set_live_complete();
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let landed = tokio::time::timeout(Duration::from_secs(5), buffer.seek(SeekFrom::End(0)))
        .await
        .expect("seek to the end returns");
    assert_eq!(landed, Some(64 * 32768));
    let mut chunk = [0u8; 4096];
    assert_eq!(buffer.read(&mut chunk).await, 0);

    assert_eq!(buffer.seek(SeekFrom::Start(0)).await, Some(0));
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    assert!(SimulatedDvr::verify_pattern(0, &chunk));

    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_within_in_flight_block_keeps_the_window() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(300_000, 0);
    let buffer = Arc::new(RingTimeshift::new(dvr.context(ring_config())));
    buffer.open(LIVE).await.unwrap();

    // Drain every whole block; the request for the next one stays pending.
    let mut chunk = vec![0u8; 65536];
    while buffer.position() < 294_912 {
        if buffer.read(&mut chunk).await == 0 {
            break;
        }
    }
    assert_eq!(buffer.position(), 294_912);

    let seek = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move { buffer.seek(SeekFrom::Current(100)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    dvr.append_live(40_000);
    assert_eq!(seek.await.unwrap(), Some(295_012));

    let mut small = [0u8; 4096];
    assert_eq!(buffer.read(&mut small).await, 4096);
    assert!(SimulatedDvr::verify_pattern(295_012, &small));

    let stats = dvr.stats();
    assert_eq!(stats.repeated_requests, 0);
    assert_eq!(stats.block_connections, 1);
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_failures_end_the_stream() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();

    dvr.fail_stream_info(1_000);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(!buffer.is_real_time_stream());
    let mut chunk = [0u8; 4096];
    assert_eq!(buffer.read(&mut chunk).await, 0);
    assert_eq!(buffer.seek(SeekFrom::Start(0)).await, None);

    buffer.close().await;
    assert_eq!(buffer.state(), StreamState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_pause_keeps_the_session_leased() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    let buffer = RingTimeshift::new(dvr.context(ring_config()));
    buffer.open(LIVE).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(dvr.stats().stream_leases, 0);

    buffer.pause_stream(true).await;
    assert_eq!(buffer.state(), StreamState::Paused);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(dvr.stats().stream_leases >= 2);

    buffer.pause_stream(false).await;
    let mut chunk = [0u8; 4096];
    assert_eq!(buffer.read(&mut chunk).await, 4096);
    assert!(SimulatedDvr::verify_pattern(0, &chunk));
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_fails_open() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(10_000_000, 0);
    dvr.fail_block_connections(true);
    let buffer = RingTimeshift::new(dvr.context(ring_config()));

    assert!(buffer.open(LIVE).await.is_err());
    assert_eq!(buffer.state(), StreamState::Closed);
    let mut chunk = [0u8; 16];
    assert_eq!(buffer.read(&mut chunk).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_wakes_blocked_reader() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(300_000, 0);
    let buffer = Arc::new(RingTimeshift::new(dvr.context(ring_config())));
    buffer.open(LIVE).await.unwrap();

    // Drain every whole block so the next read has to wait for live data.
    let mut chunk = vec![0u8; 65536];
    while buffer.position() < 294_912 {
        if buffer.read(&mut chunk).await == 0 {
            break;
        }
    }

    let reader = {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut chunk = vec![0u8; 65536];
            buffer.read(&mut chunk).await
        })
    };
    tokio::task::yield_now().await;
    buffer.close().await;
    let count = reader.await.unwrap();
    assert!(count < 65536);
}
