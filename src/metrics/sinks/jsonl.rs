//! JSON-lines metrics file.
//!
//! Append-only, one object per value, so a crash loses at most the line being
//! written and the file can be tailed while training runs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{LogError, Result};
use crate::metrics::{MetricMap, MetricValue, MetricsSink};

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Serialize)]
struct Line<'a> {
    step: u64,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<&'a Path>,
}

pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open (or create) `metrics.jsonl` inside `logdir`.
    pub fn open(logdir: &Path) -> Result<Self> {
        let path = logdir.join(METRICS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::backend("jsonl", format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn write(&mut self, metrics: &MetricMap, step: u64) -> Result<()> {
        for (name, value) in metrics {
            let line = match value {
                MetricValue::Scalar(v) => Line {
                    step,
                    name,
                    value: Some(*v),
                    video: None,
                },
                MetricValue::Video(path) => Line {
                    step,
                    name,
                    value: None,
                    video: Some(path),
                },
            };
            let json = serde_json::to_string(&line).map_err(|e| LogError::backend("jsonl", e))?;
            writeln!(self.writer, "{json}").map_err(|e| LogError::backend("jsonl", e))?;
        }
        self.writer
            .flush()
            .map_err(|e| LogError::backend("jsonl", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::open(dir.path()).unwrap();

        let mut metrics = MetricMap::new();
        metrics.insert("training/reward_frac".into(), MetricValue::Scalar(0.8));
        metrics.insert("training/video".into(), MetricValue::Video("a.mp4".into()));
        sink.write(&metrics, 12).unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "training/reward_frac");
        assert_eq!(lines[0]["value"], 0.8);
        assert_eq!(lines[0]["step"], 12);
        assert_eq!(lines[1]["video"], "a.mp4");
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut metrics = MetricMap::new();
        metrics.insert("loss".into(), MetricValue::Scalar(1.0));

        JsonlSink::open(dir.path()).unwrap().write(&metrics, 1).unwrap();
        JsonlSink::open(dir.path()).unwrap().write(&metrics, 2).unwrap();

        let content = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
