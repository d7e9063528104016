//! Epilog: durable episode logging for distributed reinforcement-learning runs.
//!
//! Records the outcome of every simulation episode in a crash-safe JSON log,
//! forwards derived metrics to monitoring backends, and keeps one logical set
//! of cumulative counters consistent across many workers.

pub mod config;
pub mod episode;
pub mod error;
pub mod metrics;
pub mod stats;
pub mod storage;
