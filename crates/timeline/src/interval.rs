use crate::Error;

/// Number of ticks in one second (ticks are 100 ns)
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Seconds between 1601-01-01 (tick epoch) and 1970-01-01 (unix epoch)
pub const UNIX_EPOCH_OFFSET_SECONDS: u64 = 11_644_473_600;

/// Converts ticks to whole unix seconds, saturating at zero for pre-1970 ticks
pub fn ticks_to_unix_seconds(ticks: u64) -> u64 {
    (ticks / TICKS_PER_SECOND).saturating_sub(UNIX_EPOCH_OFFSET_SECONDS)
}

/// Converts unix seconds to ticks
pub fn unix_seconds_to_ticks(seconds: u64) -> u64 {
    (seconds + UNIX_EPOCH_OFFSET_SECONDS) * TICKS_PER_SECOND
}

/// A half-open `[start, end)` span of ticks during which a tracked process was running.
///
/// `start <= end` always holds. Zero-length intervals are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeInterval {
    pub start: u64,
    pub end: u64,
}

impl TimeInterval {
    /// Creates an interval from producer-supplied bounds.
    ///
    /// Producers guarantee `start <= end`; this is only checked in debug builds.
    /// Use [`TimeInterval::try_new`] for untrusted input.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted interval {}..{}", start, end);
        Self { start, end }
    }

    /// Creates an interval, rejecting inverted bounds
    pub fn try_new(start: u64, end: u64) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvertedInterval { start, end });
        }
        Ok(Self { start, end })
    }

    /// Length of the interval in ticks
    pub fn duration_ticks(&self) -> u64 {
        self.end - self.start
    }

    /// Length of the interval in whole seconds
    pub fn duration_seconds(&self) -> u64 {
        self.duration_ticks() / TICKS_PER_SECOND
    }

    /// True when the two intervals overlap or share an endpoint
    pub fn touches(&self, other: &TimeInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}
