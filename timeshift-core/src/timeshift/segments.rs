//! Rotated segment files of a rolling-file stream.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::backend::SegmentRecord;

static FILENAME_TIMESTAMP: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d{8})[_T-]?(\d{6})").ok());

/// One rotated file within the logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub filename: String,
    /// Logical offset of the file's first byte
    pub offset: u64,
    /// Known once a newer segment supersedes this one
    pub length: Option<u64>,
    /// When this segment was first reported
    pub observed_at: DateTime<Utc>,
}

impl Segment {
    /// Offset one past the last byte, when known.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|length| self.offset + length)
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && self.end().is_none_or(|end| offset < end)
    }
}

/// How the backend decides when to start a new segment.
///
/// Chosen once per stream from the backend's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// At programme boundaries; each filename carries its scheduled end time
    Epg,
    /// Every fixed interval
    Interval(Duration),
}

impl RotationMode {
    /// When the segment after `segment` is expected to appear.
    pub fn next_rotation(&self, segment: &Segment, fallback: Duration) -> DateTime<Utc> {
        self.segment_end(segment, segment.observed_at, fallback)
    }

    /// When `segment`, begun at `started`, gives way to the next segment.
    ///
    /// In EPG mode a filename without a timestamp falls back to `fallback`
    /// for that segment only.
    pub fn segment_end(
        &self,
        segment: &Segment,
        started: DateTime<Utc>,
        fallback: Duration,
    ) -> DateTime<Utc> {
        let interval = match self {
            RotationMode::Interval(interval) => *interval,
            RotationMode::Epg => match parse_filename_timestamp(&segment.filename) {
                Some(end) => return end,
                None => {
                    warn!(
                        "Segment {} has no programme end time, expecting rotation in {:?}",
                        segment.filename, fallback
                    );
                    fallback
                }
            },
        };
        started + chrono::Duration::from_std(interval).unwrap_or_default()
    }
}

/// Parses `YYYYMMDD_HHMMSS` (UTC) embedded in a segment filename.
pub fn parse_filename_timestamp(filename: &str) -> Option<DateTime<Utc>> {
    let regex = FILENAME_TIMESTAMP.as_ref()?;
    let captures = regex.captures(filename)?;
    let text = format!("{}{}", captures.get(1)?.as_str(), captures.get(2)?.as_str());
    NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// What one update changed.
#[derive(Debug, Default)]
pub struct SegmentUpdate {
    pub appended: usize,
    pub evicted: Vec<Segment>,
}

/// Ordered segments, oldest first, capped at `max_segments`.
///
/// Offsets strictly increase and only the newest segment has an unknown
/// length.
#[derive(Debug, Clone)]
pub struct SegmentList {
    segments: VecDeque<Segment>,
    max_segments: usize,
}

impl SegmentList {
    pub fn new(max_segments: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            max_segments: max_segments.max(1),
        }
    }

    /// Merges the backend's segment list, oldest first.
    ///
    /// Records at or before the newest known offset are already known. Each
    /// newer record closes the previous newest segment and is appended.
    pub fn apply(&mut self, records: &[SegmentRecord], now: DateTime<Utc>) -> SegmentUpdate {
        let mut update = SegmentUpdate::default();

        for record in records {
            if let Some(newest) = self.segments.back_mut() {
                if record.offset <= newest.offset {
                    continue;
                }
                newest.length = Some(record.offset - newest.offset);
            }
            debug!("Segment {} starts at {}", record.filename, record.offset);
            self.segments.push_back(Segment {
                filename: record.filename.clone(),
                offset: record.offset,
                length: None,
                observed_at: now,
            });
            update.appended += 1;
        }

        while self.segments.len() > self.max_segments {
            if let Some(evicted) = self.segments.pop_front() {
                update.evicted.push(evicted);
            }
        }
        update
    }

    /// Segment holding `offset`.
    pub fn find(&self, offset: u64) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.contains(offset))
    }

    pub fn oldest(&self) -> Option<&Segment> {
        self.segments.front()
    }

    pub fn newest(&self) -> Option<&Segment> {
        self.segments.back()
    }

    /// Earliest offset still available.
    pub fn window_start(&self) -> u64 {
        self.oldest().map_or(0, |segment| segment.offset)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn records(entries: &[(&str, u64)]) -> Vec<SegmentRecord> {
        entries
            .iter()
            .map(|(name, offset)| SegmentRecord::new(*name, *offset))
            .collect()
    }

    #[test]
    fn test_rotation_closes_previous_segment() {
        let now = Utc::now();
        let mut list = SegmentList::new(4);
        list.apply(&records(&[("A", 0), ("B", 1000)]), now);

        let update = list.apply(&records(&[("A", 0), ("B", 1000), ("C", 2000)]), now);
        assert_eq!(update.appended, 1);

        let summary: Vec<_> = list
            .iter()
            .map(|s| (s.filename.as_str(), s.offset, s.length))
            .collect();
        assert_eq!(
            summary,
            vec![("A", 0, Some(1000)), ("B", 1000, Some(1000)), ("C", 2000, None)]
        );
        assert_eq!(list.find(1999).map(|s| s.filename.as_str()), Some("B"));
        assert_eq!(list.find(2000).map(|s| s.filename.as_str()), Some("C"));
        assert_eq!(list.find(u64::MAX).map(|s| s.filename.as_str()), Some("C"));
    }

    #[test]
    fn test_eviction_trims_oldest() {
        let mut list = SegmentList::new(2);
        let update = list.apply(&records(&[("A", 0), ("B", 10), ("C", 20)]), Utc::now());
        assert_eq!(update.evicted.len(), 1);
        assert_eq!(update.evicted[0].filename, "A");
        assert_eq!(list.window_start(), 10);
        assert!(list.find(5).is_none());
    }

    #[test]
    fn test_out_of_order_records_ignored() {
        let mut list = SegmentList::new(4);
        list.apply(&records(&[("B", 1000)]), Utc::now());
        let update = list.apply(&records(&[("A", 0)]), Utc::now());
        assert_eq!(update.appended, 0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_epg_rotation_uses_filename_end_time() {
        let observed = Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap();
        let segment = Segment {
            filename: "live-7-20240301_193000.ts".to_string(),
            offset: 0,
            length: None,
            observed_at: observed,
        };
        let next = RotationMode::Epg.next_rotation(&segment, Duration::from_secs(900));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 19, 30, 0).unwrap());
    }

    #[test]
    fn test_epg_rotation_falls_back_for_unparseable_name() {
        let observed = Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap();
        let segment = Segment {
            filename: "live-7.ts".to_string(),
            offset: 0,
            length: None,
            observed_at: observed,
        };
        let next = RotationMode::Epg.next_rotation(&segment, Duration::from_secs(900));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 19, 15, 0).unwrap());
    }

    #[test]
    fn test_interval_rotation() {
        let observed = Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap();
        let segment = Segment {
            filename: "live-7-20240301_193000.ts".to_string(),
            offset: 0,
            length: None,
            observed_at: observed,
        };
        let mode = RotationMode::Interval(Duration::from_secs(600));
        assert_eq!(
            mode.next_rotation(&segment, Duration::from_secs(900)),
            Utc.with_ymd_and_hms(2024, 3, 1, 19, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_segment_end_counts_from_given_start() {
        let observed = Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        let segment = Segment {
            filename: "live-7-20240301_193000.ts".to_string(),
            offset: 0,
            length: Some(1_000),
            observed_at: observed,
        };
        let mode = RotationMode::Interval(Duration::from_secs(600));
        assert_eq!(
            mode.segment_end(&segment, started, Duration::from_secs(900)),
            Utc.with_ymd_and_hms(2024, 3, 1, 18, 10, 0).unwrap()
        );
        assert_eq!(
            RotationMode::Epg.segment_end(&segment, started, Duration::from_secs(900)),
            Utc.with_ymd_and_hms(2024, 3, 1, 19, 30, 0).unwrap()
        );
    }
}
