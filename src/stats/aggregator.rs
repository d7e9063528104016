//! The single authoritative owner of counters and the episode log.
//!
//! A [`StatsAggregator`] wraps one [`EpisodeLogger`] and serves requests from
//! any number of [`RemoteProxy`](super::RemoteProxy) handles over one
//! channel. Requests are handled strictly in arrival order, which is the only
//! thing serializing appends to the episode log.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cumulative::CumulativeStats;
use crate::config::EpisodeType;
use crate::episode::{EpisodeLog, EpisodeLogger, EpisodeOutcome, Trajectory};
use crate::error::Result;
use crate::metrics::MetricMap;

/// Counters as of one processed request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReply {
    /// Position of the request in the aggregator's processing order,
    /// starting at 1.
    pub revision: u64,
    pub stats: CumulativeStats,
}

pub(crate) enum AggregatorRequest {
    LogEpisode {
        outcome: EpisodeOutcome,
        trajectory: Option<Trajectory>,
        step_delta: u64,
        reply: oneshot::Sender<StatsReply>,
    },
    LogScalars {
        data: MetricMap,
        step: Option<u64>,
        tag: Option<String>,
        step_delta: u64,
        reply: oneshot::Sender<StatsReply>,
    },
    /// Apply a step delta and report the counters; nothing is logged.
    Sync {
        step_delta: u64,
        reply: oneshot::Sender<StatsReply>,
    },
    ReplaceStats {
        stats: CumulativeStats,
    },
    Snapshot {
        reply: oneshot::Sender<StatsReply>,
    },
}

impl AggregatorRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::LogEpisode { .. } => "log_episode",
            Self::LogScalars { .. } => "log_scalars",
            Self::Sync { .. } => "sync",
            Self::ReplaceStats { .. } => "replace_stats",
            Self::Snapshot { .. } => "snapshot",
        }
    }
}

/// Cloneable sender side of an aggregator.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorRequest>,
    episode_type: EpisodeType,
}

impl AggregatorHandle {
    /// A handle whose requests land in the returned receiver instead of a
    /// running aggregator.
    pub(crate) fn detached(
        episode_type: EpisodeType,
    ) -> (Self, mpsc::UnboundedReceiver<AggregatorRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, episode_type }, rx)
    }

    /// Episode type of the aggregator's logger.
    pub fn episode_type(&self) -> EpisodeType {
        self.episode_type
    }

    /// Whether the aggregator has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a request. Returns `false` if the aggregator has stopped.
    pub(crate) fn send(&self, request: AggregatorRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    /// The aggregator's counters after every request queued before this call.
    ///
    /// This is the exact read; proxies only ever hold approximations.
    /// Returns `None` once the aggregator has stopped.
    pub async fn snapshot(&self) -> Option<StatsReply> {
        let (reply, rx) = oneshot::channel();
        if !self.send(AggregatorRequest::Snapshot { reply }) {
            return None;
        }
        rx.await.ok()
    }
}

impl std::fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("episode_type", &self.episode_type)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

pub struct StatsAggregator {
    logger: EpisodeLogger,
    revision: u64,
}

impl StatsAggregator {
    pub fn new(logger: EpisodeLogger) -> Self {
        Self {
            logger,
            revision: 0,
        }
    }

    /// Move the aggregator onto a blocking task of the current tokio runtime.
    ///
    /// The task ends with `Ok` once every handle is dropped, or with the
    /// storage error that made the episode log unusable.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(self) -> (AggregatorHandle, JoinHandle<Result<()>>) {
        let episode_type = self.logger.episode_type();
        let (handle, rx) = AggregatorHandle::detached(episode_type);
        let task = tokio::task::spawn_blocking(move || self.run(rx));
        (handle, task)
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<AggregatorRequest>) -> Result<()> {
        info!(
            episode_type = %self.logger.episode_type(),
            log = ?self.logger.log_path(),
            "Stats aggregator started"
        );
        while let Some(request) = rx.blocking_recv() {
            if let Err(e) = self.process(request) {
                error!(error = %e, revision = self.revision, "Stats aggregator stopped");
                return Err(e);
            }
        }
        info!(revision = self.revision, "Stats aggregator shut down");
        self.logger.close()
    }

    fn process(&mut self, request: AggregatorRequest) -> Result<()> {
        self.revision += 1;
        debug!(revision = self.revision, request = request.kind(), "Processing request");

        match request {
            AggregatorRequest::LogEpisode {
                outcome,
                trajectory,
                step_delta,
                reply,
            } => {
                self.logger.add_steps(step_delta);
                let result = self.logger.log_episode(outcome, trajectory);
                self.recover(result)?;
                self.reply(reply);
            }
            AggregatorRequest::LogScalars {
                data,
                step,
                tag,
                step_delta,
                reply,
            } => {
                self.logger.add_steps(step_delta);
                let result = self.logger.log_scalars(data, step, tag.as_deref());
                self.recover(result)?;
                self.reply(reply);
            }
            AggregatorRequest::Sync { step_delta, reply } => {
                self.logger.add_steps(step_delta);
                self.reply(reply);
            }
            AggregatorRequest::ReplaceStats { stats } => {
                self.logger.replace_stats(stats);
            }
            AggregatorRequest::Snapshot { reply } => self.reply(reply),
        }
        Ok(())
    }

    /// Keep serving after non-fatal errors.
    fn recover(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, revision = self.revision, "Rejected remote request");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn reply(&self, reply: oneshot::Sender<StatsReply>) {
        // The proxy may have given up on this request.
        let _ = reply.send(StatsReply {
            revision: self.revision,
            stats: self.logger.cumulative_stats(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggerConfig, SinkConfig};
    use crate::error::LogError;
    use crate::stats::LogRegistry;

    fn logger(config: LoggerConfig) -> EpisodeLogger {
        EpisodeLogger::new(config.with_sinks(SinkConfig::none()), &LogRegistry::default(), None).unwrap()
    }

    fn episode(handle: &AggregatorHandle, level: &str, step_delta: u64) -> oneshot::Receiver<StatsReply> {
        let (reply, rx) = oneshot::channel();
        assert!(handle.send(AggregatorRequest::LogEpisode {
            outcome: EpisodeOutcome::single(level, step_delta, 1.0, true),
            trajectory: None,
            step_delta,
            reply,
        }));
        rx
    }

    #[tokio::test]
    async fn requests_are_applied_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = StatsAggregator::new(logger(LoggerConfig::default().with_logdir(dir.path()))).spawn();

        let first = episode(&handle, "a", 10);
        let second = episode(&handle, "b", 5);
        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(first.stats.get("training_steps"), 10);
        assert_eq!(second.stats.get("training_steps"), 15);
        assert_eq!(second.stats.get("training_episodes"), 2);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.revision, 3);
        assert_eq!(snapshot.stats, second.stats);

        drop(handle);
        task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(dir.path().join("training-log.json")).unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        let levels: Vec<&str> = entries.iter().map(|e| e["level_name"].as_str().unwrap()).collect();
        assert_eq!(levels, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn replace_stats_overrides_counters() {
        let (handle, _task) = StatsAggregator::new(logger(LoggerConfig::default())).spawn();

        let stats: CumulativeStats = [("training_steps".to_string(), 1000u64)].into_iter().collect();
        assert!(handle.send(AggregatorRequest::ReplaceStats { stats }));
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.stats.get("training_steps"), 1000);
        assert_eq!(snapshot.stats.get("training_episodes"), 0);
    }

    #[tokio::test]
    async fn invalid_record_is_not_fatal() {
        let (handle, task) = StatsAggregator::new(logger(LoggerConfig::default())).spawn();

        let mut outcome = EpisodeOutcome::single("bad", 1, 1.0, true);
        outcome.length = crate::episode::PerAgent::Multi(vec![1, 2]);
        let (reply, rx) = oneshot::channel();
        handle.send(AggregatorRequest::LogEpisode {
            outcome,
            trajectory: None,
            step_delta: 1,
            reply,
        });
        assert!(rx.await.is_ok());
        assert!(handle.snapshot().await.is_some());

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn storage_failure_stops_the_aggregator() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("training-log.json"), b"not a log").unwrap();
        let (handle, task) = StatsAggregator::new(logger(LoggerConfig::default().with_logdir(dir.path()))).spawn();

        let reply = episode(&handle, "a", 1);
        assert!(reply.await.is_err());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LogError::Storage { .. }));
        assert!(handle.snapshot().await.is_none());
        assert!(handle.is_closed());
    }
}
