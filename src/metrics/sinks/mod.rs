//! Concrete metrics backends.
//!
//! - [`NoopSink`] discards everything.
//! - [`JsonlSink`] appends one JSON line per value to `metrics.jsonl`.
//! - [`TensorboardSink`] writes TensorBoard event files.
//! - [`TrackerSink`] forwards to an experiment tracker over HTTP.

pub mod jsonl;
pub mod tensorboard;
pub mod tracker;

pub use jsonl::JsonlSink;
pub use tensorboard::TensorboardSink;
pub use tracker::TrackerSink;

use super::{MetricMap, MetricsSink};
use crate::error::Result;

/// Sink that discards all metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn name(&self) -> &str {
        "noop"
    }

    fn write(&mut self, _metrics: &MetricMap, _step: u64) -> Result<()> {
        Ok(())
    }
}
