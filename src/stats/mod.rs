//! Cumulative counters and their sharing.
//!
//! Within one process, loggers writing into the same directory share a
//! [`SharedStats`] handed out by the [`LogRegistry`]. Across workers, one
//! [`StatsAggregator`] owns the counters and the episode log, and every
//! worker talks to it through a [`RemoteProxy`].

pub mod aggregator;
pub mod cumulative;
pub mod proxy;
pub mod registry;

pub use aggregator::{AggregatorHandle, StatsAggregator, StatsReply};
pub use cumulative::{lock_stats, CumulativeStats, SharedStats};
pub use proxy::{PendingSync, RemoteProxy};
pub use registry::LogRegistry;
