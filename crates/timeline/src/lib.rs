//! # Timeline
//!
//! Building blocks for turning the running intervals of monitored processes into
//! usage histograms.
//!
//! The crate is split into three layers:
//!
//! - [`TimeInterval`] and the tick helpers, describing a half-open `[start, end)`
//!   span expressed in 100 ns ticks since 1601-01-01 UTC.
//! - [`IntervalMerger`], which keeps a sorted sequence of strictly disjoint
//!   intervals and folds new intervals into it.
//! - The bucketing functions ([`choose_bucket_width`], [`aggregate`]) and
//!   [`TimeUnit`], which turn per-interval durations into a sparse histogram
//!   at a resolution adapted to the visible range.

pub mod bucket;
pub mod interval;
pub mod merger;
pub mod unit;

pub use bucket::*;
pub use interval::*;
pub use merger::*;
pub use unit::*;

use thiserror::Error;

/// Errors raised by the timeline primitives
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// An interval whose end lies before its start
    #[error("interval end {end} is before its start {start}")]
    InvertedInterval { start: u64, end: u64 },

    /// Bucketing requested with a zero-width bucket
    #[error("bucket width must be greater than zero")]
    ZeroBucketWidth,
}
