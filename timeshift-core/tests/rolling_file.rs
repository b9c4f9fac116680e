//! Rolling-file timeshift against the simulated DVR.

use std::io::SeekFrom;
use std::time::Duration;

use timeshift_core::backend::SegmentRecord;
use timeshift_core::config::{StreamingMethod, TimeshiftConfig};
use timeshift_core::simulation::SimulatedDvr;
use timeshift_core::timeshift::segments::RotationMode;
use timeshift_core::timeshift::{RollingFile, StreamState, TimeshiftBuffer, TimeshiftError};

const LIVE: &str = "sim://live/7";

fn rolling_config() -> TimeshiftConfig {
    let mut config = TimeshiftConfig::for_testing();
    config.streaming.method = StreamingMethod::RollingFile;
    config.streaming.prebuffer = Duration::ZERO;
    config
}

/// Reads until `end`, returning what arrived.
async fn read_to(buffer: &dyn TimeshiftBuffer, end: u64) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 300];
    for _ in 0..1_000 {
        let position = buffer.position();
        if position >= end {
            break;
        }
        let wanted = ((end - position) as usize).min(chunk.len());
        let count = buffer.read(&mut chunk[..wanted]).await;
        received.extend_from_slice(&chunk[..count]);
    }
    received
}

fn summary(buffer: &RollingFile) -> Vec<(String, u64, Option<u64>)> {
    buffer
        .segments()
        .into_iter()
        .map(|segment| (segment.filename, segment.offset, segment.length))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_rotation_appends_segment_and_reading_crosses_into_it() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(1_500, 0);
    dvr.set_segments(vec![SegmentRecord::new("A", 0), SegmentRecord::new("B", 1_000)]);

    let buffer = RollingFile::new(dvr.context(rolling_config()));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(
        buffer.rotation_mode(),
        RotationMode::Interval(TimeshiftConfig::for_testing().streaming.rollover_interval)
    );
    assert_eq!(
        summary(&buffer),
        vec![
            ("A".to_string(), 0, Some(1_000)),
            ("B".to_string(), 1_000, None)
        ]
    );

    assert_eq!(buffer.seek(SeekFrom::Start(0)).await, Some(0));
    let received = read_to(&buffer, 1_500).await;
    assert_eq!(received.len(), 1_500);
    assert!(SimulatedDvr::verify_pattern(0, &received));

    dvr.append_live(1_000);
    dvr.set_segments(vec![
        SegmentRecord::new("A", 0),
        SegmentRecord::new("B", 1_000),
        SegmentRecord::new("C", 2_000),
    ]);

    let received = read_to(&buffer, 2_500).await;
    assert_eq!(received.len(), 1_000);
    assert!(SimulatedDvr::verify_pattern(1_500, &received));
    assert_eq!(
        summary(&buffer),
        vec![
            ("A".to_string(), 0, Some(1_000)),
            ("B".to_string(), 1_000, Some(1_000)),
            ("C".to_string(), 2_000, None)
        ]
    );

    buffer.close().await;
    assert_eq!(buffer.state(), StreamState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_seek_maps_offset_onto_segment() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(50_000, 0);
    dvr.set_segment_size(10_000);

    let buffer = RollingFile::new(dvr.context(rolling_config()));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(buffer.segments().len(), 4);
    assert_eq!(buffer.segments()[0].offset, 20_000);

    assert_eq!(buffer.seek(SeekFrom::Start(33_333)).await, Some(33_333));
    let received = read_to(&buffer, 34_000).await;
    assert!(SimulatedDvr::verify_pattern(33_333, &received));

    // Clamped to the retained window.
    assert_eq!(buffer.seek(SeekFrom::Start(0)).await, Some(20_000));
    assert_eq!(buffer.seek(SeekFrom::End(10)).await, Some(50_000));
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_eviction_during_playback_advances_window_start() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(35_000, 0);
    dvr.set_segment_size(10_000);
    let config = rolling_config();
    let interval = config.streaming.rollover_interval.as_secs() as i64;

    let buffer = RollingFile::new(dvr.context(config));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(buffer.segments().len(), 4);
    assert_eq!(buffer.seek(SeekFrom::Start(12_000)).await, Some(12_000));
    let received = read_to(&buffer, 13_000).await;
    assert!(SimulatedDvr::verify_pattern(12_000, &received));
    let before = buffer.stream_times().unwrap();

    dvr.append_live(10_000);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(buffer.segments()[0].offset, 10_000);

    let after = buffer.stream_times().unwrap();
    assert_eq!(after.start_time, before.start_time + interval);

    let received = read_to(&buffer, 14_000).await;
    assert_eq!(received.len(), 1_000);
    assert!(SimulatedDvr::verify_pattern(13_000, &received));
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_epg_rollover_selected_from_capabilities() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(5_000, 0);
    dvr.set_epg_rollover(true);

    let buffer = RollingFile::new(dvr.context(rolling_config()));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(buffer.rotation_mode(), RotationMode::Epg);
    buffer.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_finished_empty_stream_fails_open() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(0, 0);
    dvr.set_live_complete();

    let buffer = RollingFile::new(dvr.context(rolling_config()));
    assert!(matches!(
        buffer.open(LIVE).await,
        Err(TimeshiftError::StreamNotReady { .. })
    ));
    assert_eq!(buffer.state(), StreamState::Closed);
    assert_eq!(dvr.stats().stream_stops, 1);
}

#[tokio::test(start_paused = true)]
async fn test_completed_stream_reads_to_end() {
    let dvr = SimulatedDvr::new();
    dvr.set_live(2_000, 1_000);
    dvr.set_segment_size(1_000);
    dvr.set_live_complete();

    let buffer = RollingFile::new(dvr.context(rolling_config()));
    buffer.open(LIVE).await.unwrap();
    assert_eq!(buffer.seek(SeekFrom::Start(1_500)).await, Some(1_500));

    let received = read_to(&buffer, 2_000).await;
    assert!(SimulatedDvr::verify_pattern(1_500, &received));
    let mut chunk = [0u8; 64];
    assert_eq!(buffer.read(&mut chunk).await, 0);
    assert!(buffer.is_complete());
    buffer.close().await;
}
