//! A compact set of non-overlapping `u64` ranges, used for received/acked packet numbers.

use std::collections::BTreeMap;
use std::ops::Range;

/// Tracks a set of `u64` values as a sorted collection of disjoint half-open ranges.
///
/// Keyed in the underlying map by each range's exclusive upper bound, so `range(a..b)` style
/// queries land on the right bucket without a linear scan.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    // end -> start
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn insert_one(&mut self, x: u64) {
        self.insert(x..x + 1);
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // Merge with a preceding range that touches or overlaps `start`.
        if let Some((&prev_end, &prev_start)) = self.ranges.range(..=start).next_back() {
            if prev_end >= start {
                start = start.min(prev_start);
                end = end.max(prev_end);
                self.ranges.remove(&prev_end);
            }
        }

        // Merge with any following ranges overlapped by the new extent.
        let overlapping: Vec<u64> = self
            .ranges
            .range(start..=end)
            .map(|(&e, _)| e)
            .collect();
        for e in overlapping {
            if let Some(&s) = self.ranges.get(&e) {
                start = start.min(s);
                end = end.max(e);
                self.ranges.remove(&e);
            }
        }

        self.ranges.insert(end, start);
    }

    pub fn contains(&self, x: u64) -> bool {
        self.ranges
            .range(x + 1..)
            .next()
            .map_or(false, |(&end, &start)| start <= x && x < end)
    }

    /// Removes everything in `other` from this set.
    pub fn subtract(&mut self, other: &RangeSet) {
        for (start, end) in other.iter() {
            self.remove(start..end);
        }
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let affected: Vec<(u64, u64)> = self
            .ranges
            .range(range.start + 1..)
            .take_while(|(_, &start)| start < range.end)
            .map(|(&end, &start)| (start, end))
            .collect();
        for (start, end) in affected {
            self.ranges.remove(&end);
            if start < range.start {
                self.ranges.insert(range.start, start);
            }
            if end > range.end {
                self.ranges.insert(end, range.end);
            }
        }
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&end, &start) = self.ranges.iter().next()?;
        self.ranges.remove(&end);
        Some(start..end)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&end, &start)| (start, end))
    }

    pub fn max(&self) -> Option<u64> {
        self.ranges.keys().next_back().map(|&end| end - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_contains() {
        let mut rs = RangeSet::new();
        rs.insert(1..4);
        rs.insert(5..6);
        assert!(rs.contains(1));
        assert!(rs.contains(3));
        assert!(!rs.contains(4));
        assert!(rs.contains(5));
        assert!(!rs.contains(6));
    }

    #[test]
    fn merges_adjacent_and_overlapping() {
        let mut rs = RangeSet::new();
        rs.insert(1..3);
        rs.insert(3..5);
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec![(1, 5)]);
        rs.insert(0..1);
        assert_eq!(rs.iter().collect::<Vec<_>>(), vec![(0, 5)]);
    }

    #[test]
    fn subtract_removes_acked_ranges() {
        let mut a = RangeSet::new();
        a.insert(0..10);
        let mut b = RangeSet::new();
        b.insert(2..5);
        a.subtract(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![(0, 2), (5, 10)]);
    }

    #[test]
    fn pop_min_returns_lowest_range() {
        let mut rs = RangeSet::new();
        rs.insert(5..6);
        rs.insert(1..3);
        assert_eq!(rs.pop_min(), Some(1..3));
        assert_eq!(rs.pop_min(), Some(5..6));
        assert_eq!(rs.pop_min(), None);
    }
}
