//! Range partitioning and the work-assignment stream.
//!
//! A table of `count` records is split into contiguous half-open index ranges
//! of at most `threshold` records. Each range is bound to one of the source
//! endpoints in round-robin order so that reads are spread across proxies.
//!
//! The ranges travel to workers as a work-assignment stream: one
//! `endpoint\tstart\tend\n` line per range, consumed front to back.

use crate::error::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

/// A contiguous half-open span of record indices assigned to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRange {
    /// Endpoint (`host:port`) the range is read from.
    pub endpoint: String,
    /// First record index (inclusive).
    pub start: u64,
    /// Last record index (exclusive).
    pub end: u64,
}

impl TransferRange {
    /// Number of records in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Encode as one line of the work-assignment stream.
    pub fn to_assignment_line(&self) -> String {
        format!("{}\t{}\t{}\n", self.endpoint, self.start, self.end)
    }

    /// Parse one line of the work-assignment stream.
    pub fn parse_assignment_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.split('\t');
        let (Some(endpoint), Some(start), Some(end), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ImportError::Config(format!(
                "malformed assignment line: {:?}",
                line
            )));
        };

        let parse = |field: &str| {
            field.parse::<u64>().map_err(|e| {
                ImportError::Config(format!("malformed assignment index {:?}: {}", field, e))
            })
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if endpoint.is_empty() || start > end {
            return Err(ImportError::Config(format!(
                "malformed assignment line: {:?}",
                line
            )));
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            start,
            end,
        })
    }
}

impl fmt::Display for TransferRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{},{})", self.endpoint, self.start, self.end)
    }
}

/// Split `[0, count)` into ranges of at most `threshold` records.
///
/// Produces exactly `ceil(count / threshold)` ranges in index order; range `i`
/// is `[i * threshold, min(count, (i + 1) * threshold))` and is read from
/// `endpoints[i % endpoints.len()]`. Identical inputs always produce the same
/// ranges.
pub fn partition(count: u64, threshold: u64, endpoints: &[String]) -> Result<Vec<TransferRange>> {
    if count == 0 {
        return Err(ImportError::Config(
            "cannot partition an empty table".into(),
        ));
    }
    if threshold == 0 {
        return Err(ImportError::Config(
            "record threshold must be at least 1".into(),
        ));
    }
    if endpoints.is_empty() {
        return Err(ImportError::Config(
            "at least one source endpoint is required".into(),
        ));
    }

    let pieces = count.div_ceil(threshold);
    let ranges = (0..pieces)
        .map(|i| TransferRange {
            endpoint: endpoints[(i % endpoints.len() as u64) as usize].clone(),
            start: i * threshold,
            end: count.min((i + 1) * threshold),
        })
        .collect();

    Ok(ranges)
}

/// Encode ranges as a work-assignment stream.
pub fn encode_assignments(ranges: &[TransferRange]) -> String {
    ranges.iter().map(TransferRange::to_assignment_line).collect()
}

/// Ordered queue of unclaimed assignments shared by workers.
///
/// Every assignment is handed out exactly once, in stream order.
#[derive(Debug, Default)]
pub struct AssignmentQueue {
    pending: Mutex<VecDeque<TransferRange>>,
}

impl AssignmentQueue {
    pub fn new(ranges: impl IntoIterator<Item = TransferRange>) -> Self {
        Self {
            pending: Mutex::new(ranges.into_iter().collect()),
        }
    }

    /// Build a queue from a work-assignment stream. Blank lines are ignored.
    pub fn from_stream(stream: &str) -> Result<Self> {
        let ranges = stream
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(TransferRange::parse_assignment_line)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ranges))
    }

    /// Claim the next assignment, or `None` once the stream is exhausted.
    pub fn next_assignment(&self) -> Option<TransferRange> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Number of assignments not yet claimed.
    pub fn remaining(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Tracks completed ranges to report how far an import got contiguously.
///
/// Workers finish ranges out of order. Only the prefix of the index space that
/// is covered without gaps counts as done.
#[derive(Debug, Default)]
pub struct CompletedRanges {
    /// Completed ranges as end indexed by start.
    ranges: BTreeMap<u64, u64>,
}

impl CompletedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished range.
    pub fn add(&mut self, range: &TransferRange) {
        let end = self.ranges.entry(range.start).or_insert(range.end);
        if range.end > *end {
            *end = range.end;
        }
    }

    /// The highest index `n` such that `[0, n)` is fully covered.
    pub fn contiguous_end(&self) -> u64 {
        let mut current_end = 0;
        for (&start, &end) in &self.ranges {
            if start > current_end {
                break;
            }
            current_end = current_end.max(end);
        }
        current_end
    }

    /// Total records across recorded ranges, counting overlaps once.
    pub fn covered(&self) -> u64 {
        let mut total = 0;
        let mut reach = 0;
        for (&start, &end) in &self.ranges {
            let from = start.max(reach);
            if end > from {
                total += end - from;
            }
            reach = reach.max(end);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn bounds(ranges: &[TransferRange]) -> Vec<(u64, u64)> {
        ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_partition_with_remainder() {
        let ranges = partition(25, 10, &endpoints(&["a:1"])).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn test_partition_exact_multiple() {
        let ranges = partition(10, 10, &endpoints(&["a:1"])).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 10)]);
    }

    #[test]
    fn test_partition_threshold_larger_than_table() {
        let ranges = partition(3, 5_000_000, &endpoints(&["a:1"])).unwrap();
        assert_eq!(bounds(&ranges), vec![(0, 3)]);
    }

    #[test]
    fn test_partition_covers_table_exactly() {
        let eps = endpoints(&["a:1", "b:1", "c:1"]);
        for count in 1..=60u64 {
            for threshold in 1..=13u64 {
                let ranges = partition(count, threshold, &eps).unwrap();
                assert_eq!(ranges.len() as u64, count.div_ceil(threshold));
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges.last().unwrap().end, count);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                assert!(ranges.iter().all(|r| !r.is_empty() && r.len() <= threshold));
                assert_eq!(ranges.iter().map(TransferRange::len).sum::<u64>(), count);
            }
        }
    }

    #[test]
    fn test_partition_round_robins_endpoints() {
        let ranges = partition(50, 10, &endpoints(&["p1:13013", "p2:13013"])).unwrap();
        let assigned: Vec<_> = ranges.iter().map(|r| r.endpoint.as_str()).collect();
        assert_eq!(
            assigned,
            vec!["p1:13013", "p2:13013", "p1:13013", "p2:13013", "p1:13013"]
        );
    }

    #[test]
    fn test_partition_is_deterministic() {
        let eps = endpoints(&["p1:1", "p2:1", "p3:1"]);
        assert_eq!(
            partition(1_234_567, 100_000, &eps).unwrap(),
            partition(1_234_567, 100_000, &eps).unwrap()
        );
    }

    #[test]
    fn test_partition_rejects_bad_input() {
        assert!(partition(0, 10, &endpoints(&["a:1"])).is_err());
        assert!(partition(10, 0, &endpoints(&["a:1"])).is_err());
        assert!(partition(10, 10, &[]).is_err());
    }

    #[test]
    fn test_assignment_stream_format() {
        let ranges = partition(25, 10, &endpoints(&["mr:8013"])).unwrap();
        assert_eq!(
            encode_assignments(&ranges),
            "mr:8013\t0\t10\nmr:8013\t10\t20\nmr:8013\t20\t25\n"
        );
    }

    #[test]
    fn test_queue_hands_out_in_order() {
        let ranges = partition(25, 10, &endpoints(&["a:1", "b:1"])).unwrap();
        let queue = AssignmentQueue::from_stream(&encode_assignments(&ranges)).unwrap();
        assert_eq!(queue.remaining(), 3);
        assert_eq!(queue.next_assignment(), Some(ranges[0].clone()));
        assert_eq!(queue.next_assignment(), Some(ranges[1].clone()));
        assert_eq!(queue.next_assignment(), Some(ranges[2].clone()));
        assert_eq!(queue.next_assignment(), None);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(TransferRange::parse_assignment_line("a:1\t0").is_err());
        assert!(TransferRange::parse_assignment_line("a:1\t0\t10\textra").is_err());
        assert!(TransferRange::parse_assignment_line("a:1\tzero\t10").is_err());
        assert!(TransferRange::parse_assignment_line("a:1\t20\t10").is_err());
        assert!(TransferRange::parse_assignment_line("\t0\t10").is_err());
    }

    fn range(start: u64, end: u64) -> TransferRange {
        TransferRange {
            endpoint: "a:1".into(),
            start,
            end,
        }
    }

    #[test]
    fn test_completed_ranges_empty() {
        let done = CompletedRanges::new();
        assert_eq!(done.contiguous_end(), 0);
        assert_eq!(done.covered(), 0);
    }

    #[test]
    fn test_completed_ranges_gap() {
        let mut done = CompletedRanges::new();
        done.add(&range(0, 100));
        done.add(&range(200, 300));
        assert_eq!(done.contiguous_end(), 100);
        assert_eq!(done.covered(), 200);
    }

    #[test]
    fn test_completed_ranges_out_of_order() {
        let mut done = CompletedRanges::new();
        // A later range finishing first must not advance the contiguous prefix.
        done.add(&range(200, 300));
        assert_eq!(done.contiguous_end(), 0);
        done.add(&range(0, 100));
        assert_eq!(done.contiguous_end(), 100);
        done.add(&range(100, 200));
        assert_eq!(done.contiguous_end(), 300);
    }

    #[test]
    fn test_completed_ranges_duplicate_append() {
        let mut done = CompletedRanges::new();
        done.add(&range(0, 100));
        done.add(&range(0, 100));
        assert_eq!(done.covered(), 100);
    }
}
