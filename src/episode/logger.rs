//! The per-episode logging pipeline.
//!
//! One call to [`EpisodeLogger::log_episode`] bumps the episode counter,
//! appends one record to the episode log, optionally saves a recording and
//! pushes one batch of derived metrics.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{EpisodeOutcome, EpisodeRecord, PerAgent, Trajectory};
use super::video::{write_archive, TrajectoryRenderer, VideoPolicy};
use super::EpisodeLog;
use crate::config::{EpisodeType, LoggerConfig};
use crate::error::{LogError, Result};
use crate::metrics::{MetricMap, MetricValue, MetricsHub};
use crate::stats::{lock_stats, CumulativeStats, LogRegistry, SharedStats};
use crate::storage::AppendLog;

pub struct EpisodeLogger {
    config: LoggerConfig,
    stats: SharedStats,
    hub: MetricsHub,
    video: VideoPolicy,
    renderer: Option<Box<dyn TrajectoryRenderer>>,
    log: Option<AppendLog>,
    /// Set once an append has failed; the logger refuses further episodes.
    storage_failed: bool,
    warned_fields: HashSet<String>,
    last_record: Option<EpisodeRecord>,
    last_trajectory: Option<Trajectory>,
}

impl EpisodeLogger {
    /// Build a logger. Counters and TensorBoard writers are shared with every
    /// other logger created from `registry` for the same directory.
    ///
    /// Without a `renderer`, due recordings are archived but never rendered.
    pub fn new(
        config: LoggerConfig,
        registry: &LogRegistry,
        renderer: Option<Box<dyn TrajectoryRenderer>>,
    ) -> Result<Self> {
        config.validate()?;
        let stats = registry.stats_for(config.logdir.as_deref());
        let hub = MetricsHub::from_config(&config, registry);
        Self::with_parts(config, stats, hub, renderer)
    }

    /// Build a logger around explicit counters and sinks.
    pub fn with_parts(
        config: LoggerConfig,
        stats: SharedStats,
        hub: MetricsHub,
        renderer: Option<Box<dyn TrajectoryRenderer>>,
    ) -> Result<Self> {
        config.validate()?;
        let video = VideoPolicy::from_config(&config)?;
        {
            let mut s = lock_stats(&stats);
            s.ensure(&config.episode_type.episodes_key());
            s.ensure(&config.episode_type.steps_key());
        }
        debug!(
            episode_type = %config.episode_type,
            logdir = ?config.logdir,
            sinks = ?hub.sink_names(),
            "Created episode logger"
        );
        Ok(Self {
            config,
            stats,
            hub,
            video,
            renderer,
            log: None,
            storage_failed: false,
            warned_fields: HashSet::new(),
            last_record: None,
            last_trajectory: None,
        })
    }

    /// Replace the attached metrics sinks.
    pub fn with_hub(mut self, hub: MetricsHub) -> Self {
        self.hub = hub;
        self
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Path of the episode log, if file output is enabled.
    pub fn log_path(&self) -> Option<PathBuf> {
        let dir = self.config.logdir.as_ref()?;
        let name = self.config.episode_logname.as_ref()?;
        Some(dir.join(name))
    }

    /// The counters this logger shares with its directory.
    pub fn shared_stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// A copy of the current counters.
    pub fn cumulative_stats(&self) -> CumulativeStats {
        lock_stats(&self.stats).clone()
    }

    /// Replace every counter, e.g. when resuming a run.
    pub fn replace_stats(&mut self, stats: CumulativeStats) {
        *lock_stats(&self.stats) = stats;
        let mut s = lock_stats(&self.stats);
        s.ensure(&self.config.episode_type.episodes_key());
        s.ensure(&self.config.episode_type.steps_key());
    }

    /// The most recently logged record.
    pub fn last_record(&self) -> Option<&EpisodeRecord> {
        self.last_record.as_ref()
    }

    /// The trajectory of the most recently logged episode, if one was given.
    pub fn last_trajectory(&self) -> Option<&Trajectory> {
        self.last_trajectory.as_ref()
    }

    /// Sync and release the episode log.
    pub fn close(mut self) -> Result<()> {
        match self.log.take() {
            Some(log) => log.close(),
            None => Ok(()),
        }
    }

    fn episode_log(&mut self) -> Result<Option<&mut AppendLog>> {
        if self.storage_failed {
            let path = self.log_path().unwrap_or_default();
            return Err(LogError::storage(
                path,
                io::Error::other("episode log is unusable after an earlier write failure"),
            ));
        }
        if self.log.is_none() {
            let Some(path) = self.log_path() else {
                return Ok(None);
            };
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| LogError::storage(dir, e))?;
            }
            self.log = Some(AppendLog::open(&path)?);
        }
        Ok(self.log.as_mut())
    }

    fn persist(&mut self, record: &EpisodeRecord) -> Result<()> {
        let (json, dropped) = record.to_json();
        for err in dropped {
            self.report_dropped(err);
        }
        let appended = match self.episode_log()? {
            Some(log) => log.append(&json),
            None => return Ok(()),
        };
        if appended.is_err() {
            self.storage_failed = true;
        }
        appended
    }

    fn report_dropped(&mut self, err: LogError) {
        let field = match &err {
            LogError::Serialization { field, .. } => field.clone(),
            _ => String::new(),
        };
        if self.warned_fields.insert(field.clone()) {
            warn!(field = %field, error = %err, "Dropped episode field");
        } else {
            debug!(field = %field, "Dropped episode field again");
        }
    }

    /// Save and render a recording if this episode is due for one.
    fn record_video(
        &self,
        episode_number: u64,
        level_name: &str,
        trajectory: Option<&Trajectory>,
        stats: &CumulativeStats,
    ) -> Option<PathBuf> {
        let trajectory = trajectory?;
        if !self.video.is_due(episode_number) {
            return None;
        }
        let archive = self
            .video
            .archive_path(level_name, self.config.episode_type, stats)?;
        if archive.exists() {
            debug!(path = %archive.display(), "Recording already exists");
            return None;
        }
        if let Err(e) = write_archive(&archive, trajectory) {
            warn!(path = %archive.display(), error = %e, "Failed to save trajectory");
            return None;
        }
        let renderer = self.renderer.as_ref()?;
        match renderer.render(&archive, self.video.movie_format()) {
            Ok(movie) => Some(movie),
            Err(e) => {
                warn!(path = %archive.display(), error = %e, "Failed to render trajectory");
                None
            }
        }
    }
}

impl EpisodeLog for EpisodeLogger {
    fn episode_type(&self) -> EpisodeType {
        self.config.episode_type
    }

    fn add_steps(&mut self, steps: u64) {
        lock_stats(&self.stats).increment(&self.config.episode_type.steps_key(), steps);
    }

    fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()> {
        let episode_type = self.config.episode_type;
        let stats = {
            let mut s = lock_stats(&self.stats);
            s.increment(&episode_type.episodes_key(), 1);
            s.clone()
        };
        let episode_number = stats.get(&episode_type.episodes_key());

        let min_performance = outcome.min_performance.clone();
        let record = EpisodeRecord::from_outcome(outcome, Utc::now())?;

        info!(
            episode_type = %episode_type,
            level = %record.level_name,
            episode = episode_number,
            training_steps = stats.get("training_steps"),
            length = %compact(&record.length),
            reward = %compact(&record.reward),
            reward_possible = %compact(&record.reward_possible),
            reward_needed = %compact(&record.reward_needed),
            "Episode completed"
        );

        self.persist(&record)?;

        let mut data = episode_metrics(&record);
        if episode_type == EpisodeType::Training {
            if let Some(thresholds) = &min_performance {
                data.insert("reward_frac_needed".into(), thresholds.iter().sum::<f64>().into());
            }
        }
        if let Some(movie) =
            self.record_video(episode_number, &record.level_name, trajectory.as_ref(), &stats)
        {
            data.insert("video".into(), MetricValue::Video(movie));
        }

        let current = self.cumulative_stats();
        self.hub.push(data, None, Some(episode_type.as_str()), &current);

        self.last_record = Some(record);
        self.last_trajectory = trajectory;
        Ok(())
    }

    fn log_scalars(&mut self, data: MetricMap, step: Option<u64>, tag: Option<&str>) -> Result<()> {
        let stats = self.cumulative_stats();
        self.hub.push(data, step, tag, &stats);
        Ok(())
    }
}

/// Metrics derived from a record. The record itself keeps the raw values.
///
/// Lengths of unfinished episodes are reported as NaN; the reward fraction
/// divides by at least 1.
pub fn episode_metrics(record: &EpisodeRecord) -> MetricMap {
    let mut data = MetricMap::new();

    let lengths = record.length.to_vec();
    let rewards = record.reward.to_vec();
    let possible = record.reward_possible.to_vec();
    let completed = record.completed.to_vec();
    let names: Vec<String> = match &record.agents {
        Some(names) => names.iter().map(|n| format!("{n}-")).collect(),
        None => vec![String::new()],
    };

    for (i, prefix) in names.iter().enumerate() {
        let done = completed.get(i).copied().unwrap_or(false);
        let length = match (done, lengths.get(i)) {
            (true, Some(len)) => *len as f64,
            _ => f64::NAN,
        };
        let reward = rewards.get(i).copied().unwrap_or(0.0);
        let possible = possible.get(i).copied().unwrap_or(0.0);
        data.insert(format!("{prefix}length"), length.into());
        data.insert(format!("{prefix}reward_frac"), (reward / possible.max(1.0)).into());
        data.insert(format!("{prefix}completed"), done.into());
    }

    if let Some(effects) = &record.side_effects {
        let (amount, total) = effects
            .values()
            .fold((0.0, 0.0), |(a, t), (amount, total)| (a + amount, t + total));
        data.insert("side_effects".into(), (amount / f64::max(total, 1.0)).into());
    }

    for (key, value) in &record.extra {
        if let Some(v) = value.as_f64() {
            data.insert(key.clone(), v.into());
        } else if let Value::Bool(b) = value {
            data.insert(key.clone(), (*b).into());
        }
    }

    data
}

fn compact<T: serde::Serialize + Clone>(value: &PerAgent<T>) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
