//! Environment-side episode bookkeeping.

use tracing::debug;

use super::types::{EpisodeOutcome, Grid, Trajectory};
use super::EpisodeLog;
use crate::error::Result;

/// Counts steps into the logger and logs each episode exactly once.
///
/// Steps are forwarded to `{episode_type}_steps` as they happen, until the
/// episode is finished. When frame recording is on, every step's board and
/// goals are kept and handed over with the outcome.
pub struct EpisodeRecorder<L: EpisodeLog> {
    log: L,
    record_frames: bool,
    steps: u64,
    trajectory: Trajectory,
    finished: bool,
}

impl<L: EpisodeLog> EpisodeRecorder<L> {
    pub fn new(log: L, record_frames: bool) -> Self {
        Self {
            log,
            record_frames,
            steps: 0,
            trajectory: Trajectory::new(),
            finished: false,
        }
    }

    /// Steps counted in the current episode.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames recorded so far in the current episode.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Count one step without a frame.
    pub fn step(&mut self) {
        if self.finished {
            return;
        }
        self.steps += 1;
        self.log.add_steps(1);
    }

    /// Count one step and keep its frame if recording.
    pub fn record_step(&mut self, board: Grid, goals: Grid) {
        if self.finished {
            return;
        }
        self.step();
        if self.record_frames {
            self.trajectory.push(board, goals);
        }
    }

    /// Log the episode. Returns `false` if it was already logged.
    pub fn finish(&mut self, outcome: EpisodeOutcome) -> Result<bool> {
        if self.finished {
            debug!(level = %outcome.level_name, "Episode already logged");
            return Ok(false);
        }
        self.finished = true;
        let trajectory = if self.record_frames {
            Some(std::mem::take(&mut self.trajectory))
        } else {
            None
        };
        self.log.log_episode(outcome, trajectory)?;
        Ok(true)
    }

    /// Start a new episode.
    pub fn reset(&mut self) {
        self.steps = 0;
        self.trajectory = Trajectory::new();
        self.finished = false;
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn into_inner(self) -> L {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EpisodeType, LoggerConfig, SinkConfig};
    use crate::episode::EpisodeLogger;
    use crate::metrics::MetricMap;
    use crate::stats::LogRegistry;

    /// Remembers what it was given.
    #[derive(Default)]
    struct Captured {
        steps: u64,
        episodes: Vec<(EpisodeOutcome, Option<Trajectory>)>,
    }

    impl EpisodeLog for Captured {
        fn episode_type(&self) -> EpisodeType {
            EpisodeType::Testing
        }

        fn add_steps(&mut self, steps: u64) {
            self.steps += steps;
        }

        fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()> {
            self.episodes.push((outcome, trajectory));
            Ok(())
        }

        fn log_scalars(&mut self, _data: MetricMap, _step: Option<u64>, _tag: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn logs_once_with_frames() {
        let mut recorder = EpisodeRecorder::new(Captured::default(), true);
        for i in 0..3u16 {
            recorder.record_step(vec![vec![i]], vec![vec![0]]);
        }
        assert!(recorder.finish(EpisodeOutcome::single("lvl", 3, 1.0, true)).unwrap());
        assert!(!recorder.finish(EpisodeOutcome::single("lvl", 3, 1.0, true)).unwrap());

        // Steps after the episode ended are not counted.
        recorder.step();

        let log = recorder.into_inner();
        assert_eq!(log.steps, 3);
        assert_eq!(log.episodes.len(), 1);
        assert_eq!(log.episodes[0].1.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn reset_starts_a_fresh_episode() {
        let mut recorder = EpisodeRecorder::new(Captured::default(), false);
        recorder.step();
        recorder.finish(EpisodeOutcome::single("a", 1, 0.0, false)).unwrap();
        recorder.reset();
        recorder.record_step(vec![vec![1]], vec![vec![1]]);
        recorder.step();
        assert_eq!(recorder.steps(), 2);
        assert!(recorder.trajectory().is_empty());
        recorder.finish(EpisodeOutcome::single("b", 2, 0.0, false)).unwrap();

        let log = recorder.into_inner();
        assert_eq!(log.steps, 3);
        assert_eq!(log.episodes.len(), 2);
        assert!(log.episodes[1].1.is_none());
    }

    #[test]
    fn drives_a_local_logger_through_a_borrow() {
        let config = LoggerConfig::for_episode_type(EpisodeType::Testing).with_sinks(SinkConfig::none());
        let mut logger = EpisodeLogger::new(config, &LogRegistry::default(), None).unwrap();
        {
            let mut recorder = EpisodeRecorder::new(&mut logger, false);
            recorder.step();
            recorder.step();
            recorder.finish(EpisodeOutcome::single("lvl", 2, 0.0, true)).unwrap();
        }
        let stats = logger.cumulative_stats();
        assert_eq!(stats.get("testing_steps"), 2);
        assert_eq!(stats.get("testing_episodes"), 1);
    }
}
