//! Process-wide lookup of per-directory shared state.
//!
//! Loggers writing into the same directory share one set of counters and one
//! TensorBoard writer. Instead of module-level globals, callers create a
//! [`LogRegistry`] once and hand it to every logger they build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::cumulative::{CumulativeStats, SharedStats};
use crate::error::{LogError, Result};
use crate::metrics::sinks::tensorboard::{open_summary_writer, SharedSummaryWriter};

#[derive(Default)]
pub struct LogRegistry {
    stats: Mutex<HashMap<PathBuf, SharedStats>>,
    summary_writers: Mutex<HashMap<PathBuf, SharedSummaryWriter>>,
}

impl LogRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters for `logdir`, created on first request. Loggers without a
    /// directory share one anonymous set.
    pub fn stats_for(&self, logdir: Option<&Path>) -> SharedStats {
        let key = logdir.map(Path::to_path_buf).unwrap_or_default();
        let mut map = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(CumulativeStats::new())))
            .clone()
    }

    /// TensorBoard writer for `logdir`, created on first request and kept for
    /// the lifetime of the registry.
    pub fn summary_writer_for(&self, logdir: &Path) -> Result<SharedSummaryWriter> {
        let mut map = self
            .summary_writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(writer) = map.get(logdir) {
            return Ok(writer.clone());
        }

        std::fs::create_dir_all(logdir).map_err(|e| LogError::backend("tensorboard", e))?;
        let writer = open_summary_writer(logdir)?;
        debug!(logdir = %logdir.display(), "Created TensorBoard summary writer");
        map.insert(logdir.to_path_buf(), writer.clone());
        Ok(writer)
    }
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dirs = self.stats.lock().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("LogRegistry").field("stats_dirs", &dirs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::lock_stats;

    #[test]
    fn same_directory_shares_counters() {
        let registry = LogRegistry::new();
        let a = registry.stats_for(Some(Path::new("/runs/a")));
        let b = registry.stats_for(Some(Path::new("/runs/a")));
        let other = registry.stats_for(Some(Path::new("/runs/b")));

        lock_stats(&a).increment("training_steps", 7);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lock_stats(&b).get("training_steps"), 7);
        assert_eq!(lock_stats(&other).get("training_steps"), 0);
    }

    #[test]
    fn summary_writer_is_cached_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LogRegistry::new();
        let first = registry.summary_writer_for(dir.path()).unwrap();
        let second = registry.summary_writer_for(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
