use std::collections::BTreeMap;

use crate::unit::{DAY, HOUR, MINUTE, MONTH, SECOND, WEEK, YEAR};
use crate::{Error, TimeUnit};

/// Visible range thresholds (exclusive) and the bucket width they select,
/// widest first. Keeps roughly ten buckets in view.
const BUCKET_LADDER: [(u64, u64); 16] = [
    (10 * YEAR, YEAR),
    (4 * YEAR, 6 * MONTH),
    (2 * YEAR, 3 * MONTH),
    (10 * MONTH, MONTH),
    (6 * MONTH, 2 * WEEK),
    (2 * MONTH, WEEK),
    (MONTH, 3 * DAY),
    (2 * WEEK, DAY),
    (6 * DAY, 12 * HOUR),
    (2 * DAY, 6 * HOUR),
    (DAY, 2 * HOUR),
    (12 * HOUR, 30 * MINUTE),
    (4 * HOUR, 15 * MINUTE),
    (HOUR, 10 * MINUTE),
    (5 * MINUTE, MINUTE),
    (MINUTE, 15 * SECOND),
];

/// One `(timestamp, duration)` observation, both in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: u64,
    pub duration: u64,
}

/// Sum of the sample durations whose timestamp falls in `[start, start + width)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub start: u64,
    pub total: u64,
}

/// Rounds `value` down to a multiple of `width`
pub fn align_down(value: u64, width: u64) -> u64 {
    value - value % width
}

/// Picks the bucket width, in seconds, for a visible range of `visible_range` seconds.
///
/// The mapping is monotone: a wider range never selects a narrower bucket.
pub fn choose_bucket_width(visible_range: u64) -> u64 {
    BUCKET_LADDER
        .iter()
        .find(|(threshold, _)| visible_range > *threshold)
        .map_or(SECOND, |&(_, width)| width)
}

/// Groups samples into buckets of `width` seconds and sums their durations.
///
/// Only non-empty buckets are returned, in ascending order of start.
pub fn aggregate(samples: &[Sample], width: u64) -> Result<Vec<Bucket>, Error> {
    if width == 0 {
        return Err(Error::ZeroBucketWidth);
    }

    let mut totals: BTreeMap<u64, u64> = BTreeMap::new();
    for sample in samples {
        *totals.entry(align_down(sample.timestamp, width)).or_insert(0) += sample.duration;
    }

    Ok(totals
        .into_iter()
        .map(|(start, total)| Bucket { start, total })
        .collect())
}

/// Display unit for a bucketed series: the largest unit not exceeding the biggest bucket
pub fn display_unit(buckets: &[Bucket]) -> TimeUnit {
    let max_total = buckets.iter().map(|b| b.total).max().unwrap_or(0);
    TimeUnit::for_duration(max_total)
}
