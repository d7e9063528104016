//! Episode logging.
//!
//! - [`types`] -- episode outcomes, persisted records and trajectories.
//! - [`logger`] -- [`EpisodeLogger`], the local logging pipeline.
//! - [`video`] -- recording trigger, trajectory archives and renderers.
//! - [`recorder`] -- [`EpisodeRecorder`], the environment-side wrapper.
//!
//! Anything that accepts episodes implements [`EpisodeLog`]: the local
//! [`EpisodeLogger`] as well as [`RemoteProxy`](crate::stats::RemoteProxy).

pub mod logger;
pub mod recorder;
pub mod types;
pub mod video;

pub use logger::{episode_metrics, EpisodeLogger};
pub use recorder::EpisodeRecorder;
pub use types::{EpisodeOutcome, EpisodeRecord, PerAgent, SideEffects, Trajectory};
pub use video::{ArchiveOnly, CommandRenderer, TrajectoryRenderer};

use crate::config::EpisodeType;
use crate::error::Result;
use crate::metrics::MetricMap;

/// Destination for completed episodes and ad-hoc metrics.
///
/// Implementations are driven from one thread at a time; callers log each
/// completed episode exactly once.
pub trait EpisodeLog {
    fn episode_type(&self) -> EpisodeType;

    /// Add `steps` to the `{episode_type}_steps` counter.
    fn add_steps(&mut self, steps: u64);

    /// Record one completed episode.
    fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()>;

    /// Push arbitrary metrics under `tag/`. `step` defaults to `training_steps`.
    fn log_scalars(&mut self, data: MetricMap, step: Option<u64>, tag: Option<&str>) -> Result<()>;
}

impl<T: EpisodeLog + ?Sized> EpisodeLog for &mut T {
    fn episode_type(&self) -> EpisodeType {
        (**self).episode_type()
    }

    fn add_steps(&mut self, steps: u64) {
        (**self).add_steps(steps)
    }

    fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()> {
        (**self).log_episode(outcome, trajectory)
    }

    fn log_scalars(&mut self, data: MetricMap, step: Option<u64>, tag: Option<&str>) -> Result<()> {
        (**self).log_scalars(data, step, tag)
    }
}

impl<T: EpisodeLog + ?Sized> EpisodeLog for Box<T> {
    fn episode_type(&self) -> EpisodeType {
        (**self).episode_type()
    }

    fn add_steps(&mut self, steps: u64) {
        (**self).add_steps(steps)
    }

    fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()> {
        (**self).log_episode(outcome, trajectory)
    }

    fn log_scalars(&mut self, data: MetricMap, step: Option<u64>, tag: Option<&str>) -> Result<()> {
        (**self).log_scalars(data, step, tag)
    }
}
