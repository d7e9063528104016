//! TensorBoard event-file backend.
//!
//! `tensorboard_rs` writes events on its own thread and panics on the calling
//! side once that thread is gone. Every call into the writer is therefore
//! isolated: a panic retires the writer for every sink sharing it, and the
//! writer is leaked rather than dropped, since its `Drop` would panic again.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tensorboard_rs::summary_writer::SummaryWriter;

use crate::error::{LogError, Result};
use crate::metrics::{MetricMap, MetricsSink};

/// One writer per log directory, shared through
/// [`LogRegistry`](crate::stats::LogRegistry). `None` once the writer died.
pub type SharedSummaryWriter = Arc<Mutex<Option<SummaryWriter>>>;

/// Create a writer for `logdir`, turning a panic during setup into an error.
pub fn open_summary_writer(logdir: &Path) -> Result<SharedSummaryWriter> {
    let writer = panic::catch_unwind(|| SummaryWriter::new(logdir))
        .map_err(|_| LogError::backend("tensorboard", "event writer failed to start"))?;
    Ok(Arc::new(Mutex::new(Some(writer))))
}

/// Run `f` on the writer in `slot`. A panic retires the writer.
fn guarded<F>(slot: &mut Option<SummaryWriter>, f: F) -> Result<()>
where
    F: FnOnce(&mut SummaryWriter),
{
    let Some(writer) = slot.as_mut() else {
        return Err(LogError::backend("tensorboard", "event writer has stopped"));
    };
    if panic::catch_unwind(AssertUnwindSafe(|| f(writer))).is_ok() {
        return Ok(());
    }
    if let Some(dead) = slot.take() {
        std::mem::forget(dead);
    }
    Err(LogError::backend("tensorboard", "event writer thread died"))
}

/// Writes scalar metrics to TensorBoard. Media values are skipped.
pub struct TensorboardSink {
    writer: SharedSummaryWriter,
}

impl TensorboardSink {
    pub fn new(writer: SharedSummaryWriter) -> Self {
        Self { writer }
    }
}

impl MetricsSink for TensorboardSink {
    fn name(&self) -> &str {
        "tensorboard"
    }

    fn write(&mut self, metrics: &MetricMap, step: u64) -> Result<()> {
        let mut slot = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guarded(&mut slot, |writer| {
            for (name, value) in metrics {
                if let Some(v) = value.as_scalar() {
                    writer.add_scalar(name, v as f32, step as usize);
                }
            }
            writer.flush();
        })
    }
}
