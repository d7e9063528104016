//! Episode log persistence and offline analysis.
//!
//! - [`append_log`] -- the crash-safe streaming JSON array writer.
//! - [`loader`] -- columnar reconstruction of a persisted log.
//! - [`summary`] -- benchmark statistics over a loaded log.

pub mod append_log;
pub mod loader;
pub mod summary;

pub use append_log::{AppendLog, DelimiterState};
pub use loader::{Column, ColumnKind, LoadedLog, LogFileLoader};
pub use summary::BenchmarkSummary;
