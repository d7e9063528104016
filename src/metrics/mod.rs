//! Metric delivery to monitoring backends.
//!
//! This module provides:
//! - [`MetricValue`] / [`MetricMap`] -- what a single push carries.
//! - [`MetricsSink`] -- the capability every backend implements.
//! - [`MetricsHub`] -- fans one push out to every attached sink, adding the
//!   namespace prefix and the cumulative counters on the way.
//! - [`sinks`] -- the concrete backends (no-op, JSONL, TensorBoard, tracker).

pub mod sinks;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::LoggerConfig;
use crate::error::Result;
use crate::stats::{CumulativeStats, LogRegistry};

pub use sinks::{JsonlSink, NoopSink, TensorboardSink, TrackerSink};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A single metric value: a number, or a media artifact on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Video(PathBuf),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Video(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Scalar(v as f64)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        Self::Scalar(if v { 1.0 } else { 0.0 })
    }
}

/// Metric name -> value. Sorted so backends see keys in a stable order.
pub type MetricMap = BTreeMap<String, MetricValue>;

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// A metrics backend.
///
/// Sinks receive fully-prefixed keys and an explicit step; they skip value
/// kinds they cannot represent.
pub trait MetricsSink: Send {
    /// Short backend name used in log messages.
    fn name(&self) -> &str;

    /// Deliver one batch of metrics recorded at `step`.
    fn write(&mut self, metrics: &MetricMap, step: u64) -> Result<()>;
}

struct SinkSlot {
    sink: Box<dyn MetricsSink>,
    failures: u64,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Fans each push out to every attached sink.
///
/// A failing sink never blocks the others: its error is logged (once at
/// `warn`, afterwards at `debug`) and delivery continues.
#[derive(Default)]
pub struct MetricsHub {
    sinks: Vec<SinkSlot>,
}

impl MetricsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the sinks named in `config`. A backend that fails to start is
    /// left out for the lifetime of the hub; the rest still attach.
    pub fn from_config(config: &LoggerConfig, registry: &LogRegistry) -> Self {
        let mut hub = Self::new();
        let logdir = config.logdir.as_deref();

        if let (true, Some(dir)) = (config.sinks.tensorboard, logdir) {
            match registry.summary_writer_for(dir) {
                Ok(writer) => hub.attach(Box::new(TensorboardSink::new(writer))),
                Err(e) => warn!(error = %e, "TensorBoard logging disabled"),
            }
        }

        if let (true, Some(dir)) = (config.sinks.jsonl, logdir) {
            match JsonlSink::open(dir) {
                Ok(sink) => hub.attach(Box::new(sink)),
                Err(e) => warn!(error = %e, "JSONL metrics logging disabled"),
            }
        }

        if let Some(tracker) = &config.sinks.tracker {
            let default_name = logdir
                .and_then(|d| d.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string());
            match TrackerSink::connect(tracker, &default_name) {
                Ok(sink) => hub.attach(Box::new(sink)),
                Err(e) => warn!(error = %e, "Experiment tracker disabled"),
            }
        }

        hub
    }

    pub fn attach(&mut self, sink: Box<dyn MetricsSink>) {
        debug!(sink = sink.name(), "Attached metrics sink");
        self.sinks.push(SinkSlot { sink, failures: 0 });
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Names of the attached sinks, in attach order.
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.sink.name()).collect()
    }

    /// Push `data` under `tag/`, together with every cumulative counter.
    ///
    /// `step` defaults to the current `training_steps` counter.
    pub fn push(
        &mut self,
        data: MetricMap,
        step: Option<u64>,
        tag: Option<&str>,
        stats: &CumulativeStats,
    ) {
        let metrics = namespaced(data, tag, stats);
        let step = step.unwrap_or_else(|| stats.get("training_steps"));

        for slot in &mut self.sinks {
            if let Err(e) = slot.sink.write(&metrics, step) {
                slot.failures += 1;
                if slot.failures == 1 {
                    warn!(sink = slot.sink.name(), error = %e, "Metrics sink failed");
                } else {
                    debug!(
                        sink = slot.sink.name(),
                        failures = slot.failures,
                        error = %e,
                        "Metrics sink failed again"
                    );
                }
            }
        }
    }
}

/// Prefix every key with `tag/` and append the flattened counters.
pub fn namespaced(data: MetricMap, tag: Option<&str>, stats: &CumulativeStats) -> MetricMap {
    let mut out: MetricMap = match tag {
        Some(tag) => data
            .into_iter()
            .map(|(k, v)| (format!("{tag}/{k}"), v))
            .collect(),
        None => data,
    };
    for (key, value) in stats.flattened() {
        out.insert(key, MetricValue::from(value));
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::LogError;

    /// Records every push for inspection.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub pushes: Arc<Mutex<Vec<(MetricMap, u64)>>>,
    }

    impl RecordingSink {
        pub fn last(&self) -> Option<(MetricMap, u64)> {
            self.pushes.lock().unwrap().last().cloned()
        }

        pub fn count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }
    }

    impl MetricsSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn write(&mut self, metrics: &MetricMap, step: u64) -> Result<()> {
            self.pushes.lock().unwrap().push((metrics.clone(), step));
            Ok(())
        }
    }

    /// Fails on every write.
    pub struct BrokenSink;

    impl MetricsSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        fn write(&mut self, _metrics: &MetricMap, _step: u64) -> Result<()> {
            Err(LogError::backend("broken", "connection refused"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{BrokenSink, RecordingSink};
    use super::*;

    #[test]
    fn push_prefixes_keys_and_appends_counters() {
        let recorder = RecordingSink::default();
        let mut hub = MetricsHub::new();
        hub.attach(Box::new(recorder.clone()));

        let mut stats = CumulativeStats::new();
        stats.increment("training_steps", 42);

        let mut data = MetricMap::new();
        data.insert("reward_frac".into(), 0.5.into());
        hub.push(data, None, Some("training"), &stats);

        let (metrics, step) = recorder.last().unwrap();
        assert_eq!(step, 42);
        assert_eq!(metrics["training/reward_frac"], MetricValue::Scalar(0.5));
        assert_eq!(metrics["training/steps"], MetricValue::Scalar(42.0));
        assert_eq!(metrics["testing/episodes"], MetricValue::Scalar(0.0));
        assert!(!metrics.contains_key("reward_frac"));
    }

    #[test]
    fn explicit_step_and_no_tag() {
        let recorder = RecordingSink::default();
        let mut hub = MetricsHub::new();
        hub.attach(Box::new(recorder.clone()));

        let mut data = MetricMap::new();
        data.insert("loss".into(), 1.25.into());
        hub.push(data, Some(7), None, &CumulativeStats::new());

        let (metrics, step) = recorder.last().unwrap();
        assert_eq!(step, 7);
        assert!(metrics.contains_key("loss"));
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let recorder = RecordingSink::default();
        let mut hub = MetricsHub::new();
        hub.attach(Box::new(BrokenSink));
        hub.attach(Box::new(recorder.clone()));

        for _ in 0..3 {
            hub.push(MetricMap::new(), Some(1), None, &CumulativeStats::new());
        }
        assert_eq!(recorder.count(), 3);
        assert_eq!(hub.sink_names(), vec!["broken", "recording"]);
    }

    #[test]
    fn from_config_skips_unavailable_backends() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the log directory should be: every file-based
        // backend fails to start.
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"").unwrap();

        let mut config = LoggerConfig::default().with_logdir(&blocked);
        config.sinks.jsonl = true;
        let hub = MetricsHub::from_config(&config, &LogRegistry::default());
        assert!(hub.is_empty());
    }

    #[test]
    fn bool_and_counter_conversions() {
        assert_eq!(MetricValue::from(true), MetricValue::Scalar(1.0));
        assert_eq!(MetricValue::from(3u64).as_scalar(), Some(3.0));
        assert_eq!(MetricValue::Video("a.mp4".into()).as_scalar(), None);
    }
}
