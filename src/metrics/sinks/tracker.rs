//! Experiment-tracker backend.
//!
//! Metric batches are queued on an unbounded channel and POSTed by a
//! background task, so a slow tracker never stalls episode logging.
//!
//! Calls `POST {endpoint}/runs/{run_id}/log` with a JSON body:
//!
//! ```text
//! {"project": "...", "run_name": "...", "step": 1200,
//!  "metrics": {"training/reward_frac": 0.8,
//!              "training/video": {"_type": "video", "path": "..."}}}
//! ```

use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{LogError, Result};
use crate::metrics::{MetricMap, MetricValue, MetricsSink};

const BACKEND: &str = "tracker";

pub struct TrackerSink {
    run_id: String,
    tx: mpsc::UnboundedSender<Value>,
}

impl TrackerSink {
    /// Start the background uploader.
    ///
    /// Needs a running tokio runtime; without one the tracker is reported as
    /// unavailable.
    pub fn connect(config: &TrackerConfig, default_run_name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| LogError::backend(BACKEND, e))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LogError::backend(BACKEND, e))?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let url = format!(
            "{}/runs/{run_id}/log",
            config.endpoint.trim_end_matches('/')
        );
        let api_key = config.api_key.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        runtime.spawn(async move {
            let mut failures = 0u64;
            while let Some(body) = rx.recv().await {
                let mut request = http.post(&url).json(&body);
                if let Some(key) = &api_key {
                    request = request.bearer_auth(key);
                }
                let outcome = match request.send().await {
                    Ok(resp) if resp.status().is_success() => Ok(()),
                    Ok(resp) => Err(format!("tracker returned {}", resp.status())),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(reason) = outcome {
                    failures += 1;
                    if failures == 1 {
                        warn!(url = %url, error = %reason, "Failed to upload metrics to tracker");
                    } else {
                        debug!(failures, error = %reason, "Tracker upload failed again");
                    }
                }
            }
        });

        info!(
            run_id = %run_id,
            project = %config.project,
            "Connected experiment tracker"
        );

        let run_name = config
            .run_name
            .clone()
            .unwrap_or_else(|| default_run_name.to_string());
        let sink = Self { run_id, tx };
        sink.tx
            .send(json!({
                "project": config.project,
                "run_name": run_name,
                "event": "start",
            }))
            .map_err(|e| LogError::backend(BACKEND, e))?;
        Ok(sink)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Convert a batch into the tracker's JSON shape.
fn metrics_json(metrics: &MetricMap) -> Map<String, Value> {
    metrics
        .iter()
        .map(|(name, value)| {
            let v = match value {
                MetricValue::Scalar(x) => serde_json::Number::from_f64(*x)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                MetricValue::Video(path) => json!({
                    "_type": "video",
                    "path": path.display().to_string(),
                }),
            };
            (name.clone(), v)
        })
        .collect()
}

impl MetricsSink for TrackerSink {
    fn name(&self) -> &str {
        BACKEND
    }

    fn write(&mut self, metrics: &MetricMap, step: u64) -> Result<()> {
        let body = json!({
            "step": step,
            "metrics": metrics_json(metrics),
        });
        self.tx
            .send(body)
            .map_err(|_| LogError::backend(BACKEND, "uploader task has stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig {
            endpoint: "http://127.0.0.1:9/api/".into(),
            project: "gridworld".into(),
            run_name: None,
            api_key: None,
        }
    }

    #[test]
    fn connect_without_runtime_is_unavailable() {
        let err = TrackerSink::connect(&config(), "run").err().unwrap();
        assert!(matches!(err, LogError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn write_queues_without_blocking() {
        let mut sink = TrackerSink::connect(&config(), "run").unwrap();
        assert!(!sink.run_id().is_empty());

        let mut metrics = MetricMap::new();
        metrics.insert("training/length".into(), MetricValue::Scalar(f64::NAN));
        assert!(sink.write(&metrics, 5).is_ok());
    }

    #[test]
    fn non_finite_scalars_become_null() {
        let mut metrics = MetricMap::new();
        metrics.insert("a".into(), MetricValue::Scalar(f64::NAN));
        metrics.insert("b".into(), MetricValue::Scalar(2.0));
        metrics.insert("c".into(), MetricValue::Video("/runs/x.mp4".into()));

        let json = metrics_json(&metrics);
        assert_eq!(json["a"], Value::Null);
        assert_eq!(json["b"], 2.0);
        assert_eq!(json["c"]["_type"], "video");
    }
}
