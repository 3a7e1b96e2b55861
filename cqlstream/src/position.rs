//! Per-resource position tracking: a sorted, non-overlapping set of closed integer intervals,
//! merged as positions are recorded and emitted in ascending order on close.
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Mutex;

/// A closed, inclusive interval `[lo, hi]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    /// Lower bound, inclusive.
    pub lo: u64,
    /// Upper bound, inclusive.
    pub hi: u64,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

#[derive(Default)]
struct ResourceRanges {
    ranges: Vec<Range>,
}

impl ResourceRanges {
    /// Inserts `pos`, merging with adjacent/overlapping ranges. `ranges` stays sorted and
    /// disjoint, so a binary search locates the insertion point in O(log n).
    fn insert(&mut self, pos: u64) {
        let idx = self.ranges.partition_point(|r| r.hi + 1 < pos);

        let touches = idx < self.ranges.len() && self.ranges[idx].lo <= pos + 1;

        if touches {
            self.ranges[idx].lo = self.ranges[idx].lo.min(pos);
            self.ranges[idx].hi = self.ranges[idx].hi.max(pos);
        } else {
            self.ranges.insert(idx, Range { lo: pos, hi: pos });
        }

        // A newly extended range may now touch its right neighbor; merge forward if so.
        while idx + 1 < self.ranges.len() && self.ranges[idx].hi + 1 >= self.ranges[idx + 1].lo {
            let next = self.ranges.remove(idx + 1);
            self.ranges[idx].hi = self.ranges[idx].hi.max(next.hi);
        }
    }
}

/// Tracks consumed positions across all resources, merging into contiguous ranges for compact
/// on-disk storage.
#[derive(Default)]
pub struct PositionTracker {
    resources: Mutex<FxHashMap<String, ResourceRanges>>,
}

impl PositionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `pos` was reached to a terminal state for `resource`.
    pub fn record(&self, resource: &str, pos: u64) {
        let mut guard = self.resources.lock().expect("position tracker lock poisoned");
        guard.entry(resource.to_string()).or_default().insert(pos);
    }

    /// Returns `<resource>:<lo>[-<hi>]` lines for every tracked resource, sorted by resource name
    /// and then by range.
    pub fn render(&self) -> Vec<String> {
        let guard = self.resources.lock().expect("position tracker lock poisoned");
        let mut resources: Vec<&String> = guard.keys().collect();
        resources.sort();

        let mut out = Vec::new();
        for resource in resources {
            for range in &guard[resource].ranges {
                out.push(format!("{resource}:{range}"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_position_forms_unit_range() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 1);
        assert_eq!(t.render(), vec!["file:///a.csv:1"]);
    }

    #[test]
    fn adjacent_positions_merge() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 1);
        t.record("file:///a.csv", 2);
        t.record("file:///a.csv", 3);
        assert_eq!(t.render(), vec!["file:///a.csv:1-3"]);
    }

    #[test]
    fn out_of_order_positions_merge_into_one_range() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 3);
        t.record("file:///a.csv", 1);
        t.record("file:///a.csv", 2);
        assert_eq!(t.render(), vec!["file:///a.csv:1-3"]);
    }

    #[test]
    fn gap_keeps_ranges_disjoint() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 1);
        t.record("file:///a.csv", 5);
        assert_eq!(
            t.render(),
            vec!["file:///a.csv:1", "file:///a.csv:5"]
        );
    }

    #[test]
    fn bridging_position_merges_two_ranges() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 1);
        t.record("file:///a.csv", 3);
        t.record("file:///a.csv", 2);
        assert_eq!(t.render(), vec!["file:///a.csv:1-3"]);
    }

    #[test]
    fn duplicate_position_is_idempotent() {
        let t = PositionTracker::new();
        t.record("file:///a.csv", 1);
        t.record("file:///a.csv", 1);
        assert_eq!(t.render(), vec!["file:///a.csv:1"]);
    }

    #[test]
    fn multiple_resources_sorted_independently() {
        let t = PositionTracker::new();
        t.record("file:///b.csv", 9);
        t.record("file:///a.csv", 1);
        assert_eq!(
            t.render(),
            vec!["file:///a.csv:1", "file:///b.csv:9"]
        );
    }
}
