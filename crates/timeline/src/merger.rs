use crate::TimeInterval;

/// Keeps the running history of one group as a minimal set of intervals.
///
/// `IntervalMerger` maintains a sequence of intervals sorted by `start` in which
/// every adjacent pair `(a, b)` satisfies `a.end < b.start`. Intervals that
/// overlap or share an endpoint are coalesced on insertion.
///
/// # Examples
///
/// ```
/// use timeline::{IntervalMerger, TimeInterval};
///
/// let mut merger = IntervalMerger::new();
/// merger.insert(TimeInterval::new(5, 6));
/// merger.insert(TimeInterval::new(7, 8));
/// merger.insert(TimeInterval::new(1, 3));
///
/// // Bridging interval collapses the two entries it spans
/// merger.insert(TimeInterval::new(5, 9));
/// assert_eq!(
///     merger.as_slice(),
///     &[TimeInterval::new(1, 3), TimeInterval::new(5, 9)]
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalMerger {
    intervals: Vec<TimeInterval>,
}

impl IntervalMerger {
    /// Creates an empty merger
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a merger by folding every interval of `intervals` in order
    pub fn from_intervals<I>(intervals: I) -> Self
    where
        I: IntoIterator<Item = TimeInterval>,
    {
        let mut merger = Self::new();
        for interval in intervals {
            merger.insert(interval);
        }
        merger
    }

    /// Inserts one interval, merging it with every interval it touches or overlaps.
    ///
    /// New intervals usually land at the end of the history, so the start
    /// boundary is searched backwards. The end boundary is then searched forward
    /// from there and the bridged run, if any, is collapsed in place.
    pub fn insert(&mut self, interval: TimeInterval) {
        // First existing interval that reaches `interval.start`
        let first = self
            .intervals
            .iter()
            .rposition(|existing| existing.end < interval.start)
            .map_or(0, |position| position + 1);

        // One past the last existing interval starting at or before `interval.end`
        let mut last = first;
        while last < self.intervals.len() && self.intervals[last].start <= interval.end {
            last += 1;
        }

        if first == last {
            self.intervals.insert(first, interval);
        } else {
            let start = self.intervals[first].start.min(interval.start);
            let end = self.intervals[last - 1].end.max(interval.end);
            self.intervals[first] = TimeInterval { start, end };
            self.intervals.drain(first + 1..last);
        }

        debug_assert!(self.is_normalized(), "merge left overlapping intervals");
    }

    /// Merged intervals, sorted and disjoint
    pub fn as_slice(&self) -> &[TimeInterval] {
        &self.intervals
    }

    /// Intervals that cover part of the half-open window `[from, to)`.
    ///
    /// Zero-length intervals count when they sit inside the window.
    pub fn overlapping(&self, from: u64, to: u64) -> &[TimeInterval] {
        let first = self
            .intervals
            .partition_point(|i| i.end < from || (i.end == from && i.start < from));
        let last = self.intervals.partition_point(|i| i.start < to);
        if first >= last {
            return &[];
        }
        &self.intervals[first..last]
    }

    /// Number of merged intervals
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of ticks covered
    pub fn covered_ticks(&self) -> u64 {
        self.intervals.iter().map(TimeInterval::duration_ticks).sum()
    }

    pub fn into_vec(self) -> Vec<TimeInterval> {
        self.intervals
    }

    /// Checks the sorted, strictly disjoint invariant
    pub fn is_normalized(&self) -> bool {
        self.intervals
            .windows(2)
            .all(|pair| pair[0].start <= pair[0].end && pair[0].end < pair[1].start)
    }
}
