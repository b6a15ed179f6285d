//! Heap census: per-type population over time and on-demand size totals
//!
//! - [`history`]: the sliding-window time series
//! - [`sampler`]: the background task feeding it
//! - [`sizes`]: the optional size aggregator
//! - [`events`]: tick notifications for streaming clients

pub mod events;
pub mod history;
pub mod sampler;
pub mod sizes;

pub use events::{CensusBroadcaster, CensusEvent};
pub use history::{SeriesStats, TypeHistory};
pub use sampler::{CensusSampler, TickOutcome};
pub use sizes::{format_size, SizeAggregator, TypeSizeTable, UNKNOWN_SIZE};
