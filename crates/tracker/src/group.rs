use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use timeline::{
    aggregate, align_down, choose_bucket_width, display_unit, ticks_to_unix_seconds,
    unix_seconds_to_ticks, IntervalMerger, Sample, TimeInterval, TimeUnit, TICKS_PER_SECOND,
};

/// Locks a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lower-cases and trims a process name the way group membership stores it
pub fn normalize_process_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Interval state of one group, shared between ingestion and the view.
///
/// Lock order is `merged` then `inbox`. Appending only takes `inbox`, so a
/// long merge never blocks process exit handlers for longer than the swap of
/// the inbox vector.
#[derive(Debug, Default)]
pub struct GroupIntervals {
    inbox: Mutex<Vec<TimeInterval>>,
    merged: Mutex<IntervalMerger>,
}

impl GroupIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merged(merged: IntervalMerger) -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            merged: Mutex::new(merged),
        }
    }

    /// Queues one raw interval for the next drain
    pub fn append(&self, interval: TimeInterval) {
        lock(&self.inbox).push(interval);
    }

    /// Number of raw intervals waiting to be merged
    pub fn pending(&self) -> usize {
        lock(&self.inbox).len()
    }

    /// Folds every queued interval into the merged history, in arrival order.
    ///
    /// Returns how many raw intervals were merged.
    pub fn drain(&self) -> usize {
        let mut merged = lock(&self.merged);
        Self::drain_into(&self.inbox, &mut merged)
    }

    fn drain_into(inbox: &Mutex<Vec<TimeInterval>>, merged: &mut IntervalMerger) -> usize {
        let raw = std::mem::take(&mut *lock(inbox));
        let count = raw.len();
        for interval in raw {
            merged.insert(interval);
        }
        count
    }

    /// Drains, then returns a copy of the merged history
    pub fn snapshot(&self) -> IntervalMerger {
        let mut merged = lock(&self.merged);
        Self::drain_into(&self.inbox, &mut merged);
        merged.clone()
    }

    /// Drains, then builds the view for the visible range `[from, to]` in unix seconds
    pub fn view(&self, from: u64, to: u64) -> Result<GroupView, timeline::Error> {
        let mut merged = lock(&self.merged);
        Self::drain_into(&self.inbox, &mut merged);
        build_view(&merged, from, to)
    }
}

/// Statistics over the samples visible in a view
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    /// Number of merged executions in view
    pub count: u64,
    /// Sum of durations, seconds
    pub total: u64,
    /// Longest single duration, seconds
    pub max: u64,
    /// Mean duration, seconds (0 when nothing is visible)
    pub mean: f64,
}

impl Summary {
    fn from_samples(samples: &[Sample]) -> Self {
        let count = samples.len() as u64;
        let total: u64 = samples.iter().map(|s| s.duration).sum();
        let max = samples.iter().map(|s| s.duration).max().unwrap_or(0);
        let mean = if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        };
        Self {
            count,
            total,
            max,
            mean,
        }
    }
}

/// One bar of the histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBucket {
    /// Bucket start, unix seconds
    pub start: u64,
    /// Running time in the bucket, seconds
    pub total: u64,
    /// `total` expressed in the view's display unit
    pub value: f64,
}

/// Aggregated, display-ready data for one group over a visible range
#[derive(Debug, Clone, PartialEq)]
pub struct GroupView {
    pub range_duration: u64,
    pub bucket_width: u64,
    pub unit: TimeUnit,
    pub buckets: Vec<ViewBucket>,
    pub summary: Summary,
}

/// Builds the histogram and summary of `merged` for the visible range `[from, to]`.
///
/// The window is widened outward to bucket boundaries so that edge bars are
/// complete, and each interval is clipped to that widened window.
pub fn build_view(merged: &IntervalMerger, from: u64, to: u64) -> Result<GroupView, timeline::Error> {
    let (from, to) = if from <= to { (from, to) } else { (to, from) };
    let range_duration = to - from;
    let bucket_width = choose_bucket_width(range_duration);

    let window_start = unix_seconds_to_ticks(align_down(from, bucket_width));
    let window_end = unix_seconds_to_ticks(align_down(to, bucket_width) + bucket_width);

    let samples: Vec<Sample> = merged
        .overlapping(window_start, window_end)
        .iter()
        .map(|interval| {
            let start = interval.start.max(window_start);
            let end = interval.end.min(window_end).max(start);
            Sample {
                timestamp: ticks_to_unix_seconds(start),
                duration: (end - start) / TICKS_PER_SECOND,
            }
        })
        .collect();

    let summary = Summary::from_samples(&samples);
    let buckets = aggregate(&samples, bucket_width)?;
    let unit = display_unit(&buckets);

    Ok(GroupView {
        range_duration,
        bucket_width,
        unit,
        buckets: buckets
            .into_iter()
            .map(|b| ViewBucket {
                start: b.start,
                total: b.total,
                value: unit.scale(b.total),
            })
            .collect(),
        summary,
    })
}

/// A named set of monitored executables and their running history
#[derive(Debug)]
pub struct Group {
    name: String,
    process_names: BTreeSet<String>,
    intervals: Arc<GroupIntervals>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history(name, BTreeSet::new(), IntervalMerger::new())
    }

    pub fn with_history(
        name: impl Into<String>,
        process_names: BTreeSet<String>,
        merged: IntervalMerger,
    ) -> Self {
        Self {
            name: name.into(),
            process_names,
            intervals: Arc::new(GroupIntervals::with_merged(merged)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Normalized (lower-case) process names
    pub fn process_names(&self) -> &BTreeSet<String> {
        &self.process_names
    }

    pub(crate) fn process_names_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.process_names
    }

    /// True if `normalized_name` is one of the group's executables
    pub fn claims(&self, normalized_name: &str) -> bool {
        self.process_names.contains(normalized_name)
    }

    pub fn intervals(&self) -> &Arc<GroupIntervals> {
        &self.intervals
    }

    /// Process names joined for editing, e.g. `"code; firefox"`
    pub fn processes_string(&self) -> String {
        self.process_names
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use timeline::{DAY, HOUR, MINUTE};

    fn at(seconds: u64) -> u64 {
        unix_seconds_to_ticks(seconds)
    }

    fn interval_secs(start: u64, end: u64) -> TimeInterval {
        TimeInterval::new(at(start), at(end))
    }

    #[test]
    fn test_drain_merges_in_order_and_empties_inbox() {
        let intervals = GroupIntervals::new();
        intervals.append(interval_secs(100, 200));
        intervals.append(interval_secs(150, 300));
        intervals.append(interval_secs(500, 600));
        assert_eq!(intervals.pending(), 3);

        assert_eq!(intervals.drain(), 3);
        assert_eq!(intervals.pending(), 0);
        assert_eq!(
            intervals.snapshot().as_slice(),
            &[interval_secs(100, 300), interval_secs(500, 600)]
        );

        // Draining an empty inbox is a no-op
        assert_eq!(intervals.drain(), 0);
        assert_eq!(intervals.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_appends_are_never_lost() {
        let intervals = Arc::new(GroupIntervals::new());
        let threads = 8u64;
        let per_thread = 200u64;

        let producers: Vec<_> = (0..threads)
            .map(|t| {
                let intervals = intervals.clone();
                thread::spawn(move || {
                    for i in 0..per_thread {
                        // Disjoint, non-touching intervals
                        let slot = (t * per_thread + i) * 10;
                        intervals.append(TimeInterval::new(slot, slot + 5));
                    }
                })
            })
            .collect();

        let consumer = {
            let intervals = intervals.clone();
            thread::spawn(move || {
                let mut drained = 0;
                for _ in 0..100 {
                    drained += intervals.drain();
                    thread::yield_now();
                }
                drained
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let drained = consumer.join().unwrap() + intervals.drain();

        assert_eq!(drained as u64, threads * per_thread);
        let merged = intervals.snapshot();
        assert_eq!(merged.len() as u64, threads * per_thread);
        assert!(merged.is_normalized());
    }

    #[test]
    fn test_view_buckets_and_summary() {
        let base = 1_700_000_000 - 1_700_000_000 % DAY;
        let merged = IntervalMerger::from_intervals([
            interval_secs(base + 10 * MINUTE, base + 40 * MINUTE),
            interval_secs(base + HOUR, base + HOUR + 90),
            interval_secs(base + 5 * HOUR, base + 7 * HOUR),
        ]);

        // Exactly 12 hours is not above the 12 hour threshold
        let view = build_view(&merged, base, base + 12 * HOUR).unwrap();
        assert_eq!(view.range_duration, 12 * HOUR);
        assert_eq!(view.bucket_width, 15 * MINUTE);

        assert_eq!(view.summary.count, 3);
        assert_eq!(view.summary.total, 30 * MINUTE + 90 + 2 * HOUR);
        assert_eq!(view.summary.max, 2 * HOUR);
        assert!((view.summary.mean - view.summary.total as f64 / 3.0).abs() < 1e-9);

        let starts: Vec<u64> = view.buckets.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![base, base + HOUR, base + 5 * HOUR]);
        assert_eq!(view.unit, TimeUnit::Hours);
        assert!((view.buckets[2].value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_view_clips_to_window() {
        let base = 1_700_000_000 - 1_700_000_000 % DAY;
        let merged = IntervalMerger::from_intervals([
            interval_secs(base - DAY, base + 30),
            interval_secs(base + 3 * DAY, base + 4 * DAY),
        ]);

        let view = build_view(&merged, base, base + 50).unwrap();
        assert_eq!(view.bucket_width, 1);
        assert_eq!(view.summary.count, 1);
        assert_eq!(view.summary.total, 30);
        assert_eq!(view.buckets.len(), 1);
        assert_eq!(view.buckets[0].start, base);
        assert_eq!(view.unit, TimeUnit::Seconds);
    }

    #[test]
    fn test_empty_view() {
        let view = build_view(&IntervalMerger::new(), 1000, 1000).unwrap();
        assert_eq!(view.summary, Summary::default());
        assert!(view.buckets.is_empty());
        assert_eq!(view.unit, TimeUnit::Seconds);
    }

    #[test]
    fn test_processes_string() {
        let mut group = Group::new("dev");
        group.process_names_mut().insert("firefox".to_string());
        group.process_names_mut().insert("code".to_string());
        assert_eq!(group.processes_string(), "code; firefox");
        assert!(group.claims("code"));
        assert!(!group.claims("Code"));
        assert_eq!(normalize_process_name("  Code.EXE "), "code.exe");
    }
}
