//! Worker-side handle to a [`StatsAggregator`](super::StatsAggregator).
//!
//! A [`RemoteProxy`] never waits on the aggregator for ordinary calls:
//! episodes and scalars are queued fire-and-forget, each carrying the steps
//! counted locally since the previous request (a delta, never an absolute
//! value). Reads return a cached copy of the counters which is refreshed at
//! most once per polling interval:
//!
//! 1. completed requests are drained from the front of the queue,
//! 2. the reply with the highest revision becomes the new baseline,
//! 3. everything this proxy has counted but the baseline cannot contain yet
//!    (unsent steps, steps and episodes of requests still in flight) is
//!    added back on top.
//!
//! Requests from one proxy travel in order over one channel, so every
//! request still queued behind the newest completed one is known not to be
//! reflected in it. Two proxies may briefly disagree; only
//! [`AggregatorHandle::snapshot`] gives exact values.
//!
//! Once `max_backlog` requests are outstanding, sends first release the ones
//! already answered and reads wait for the oldest one. If the aggregator stalls that wait has no timeout; if it has stopped
//! the proxy keeps counting locally and logs a single warning.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, warn};

use super::aggregator::{AggregatorHandle, AggregatorRequest, StatsReply};
use super::cumulative::CumulativeStats;
use crate::config::{EpisodeType, ProxyConfig};
use crate::episode::{EpisodeLog, EpisodeOutcome, Trajectory};
use crate::error::Result;
use crate::metrics::MetricMap;

/// One request awaiting its reply.
#[derive(Debug)]
pub struct PendingSync {
    step_delta: u64,
    episodes: u64,
    reply: oneshot::Receiver<StatsReply>,
}

impl PendingSync {
    pub fn step_delta(&self) -> u64 {
        self.step_delta
    }
}

#[derive(Debug)]
pub struct RemoteProxy {
    handle: AggregatorHandle,
    config: ProxyConfig,
    steps_key: String,
    episodes_key: String,
    cache: CumulativeStats,
    baseline_revision: u64,
    unforwarded_steps: u64,
    pending: VecDeque<PendingSync>,
    last_poll: Option<Instant>,
    unavailable: bool,
}

impl RemoteProxy {
    pub fn new(handle: AggregatorHandle, config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let episode_type = handle.episode_type();
        let steps_key = episode_type.steps_key();
        let episodes_key = episode_type.episodes_key();
        let mut cache = CumulativeStats::new();
        cache.ensure(&steps_key);
        cache.ensure(&episodes_key);
        Ok(Self {
            handle,
            config,
            steps_key,
            episodes_key,
            cache,
            baseline_revision: 0,
            unforwarded_steps: 0,
            pending: VecDeque::new(),
            last_poll: None,
            unavailable: false,
        })
    }

    pub fn handle(&self) -> &AggregatorHandle {
        &self.handle
    }

    /// Requests sent but not yet answered.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Steps counted locally and not yet sent.
    pub fn unforwarded_steps(&self) -> u64 {
        self.unforwarded_steps
    }

    /// The cached counters, without polling.
    pub fn cached_stats(&self) -> &CumulativeStats {
        &self.cache
    }

    /// The cached counters, refreshed if the polling interval has passed.
    ///
    /// Waits for the oldest outstanding request first when the backlog is
    /// full.
    pub async fn cumulative_stats(&mut self) -> &CumulativeStats {
        if self.pending.len() >= self.config.max_backlog {
            self.wait_oldest().await;
        }

        let due = self
            .last_poll
            .map_or(true, |t| t.elapsed() >= self.config.poll_interval());
        if due {
            self.last_poll = Some(Instant::now());
            self.drain();
            if self.pending.is_empty() {
                // Idle: ask for fresh counters so the cache converges.
                self.forward(0, |step_delta, reply| AggregatorRequest::Sync {
                    step_delta,
                    reply,
                });
            }
        }
        &self.cache
    }

    /// Wait until every outstanding request has been answered.
    pub async fn wait_for_pending(&mut self) {
        while !self.pending.is_empty() {
            self.wait_oldest().await;
        }
    }

    /// Replace the aggregator's counters, e.g. when resuming a run.
    ///
    /// Replies to earlier requests are discarded since they predate the
    /// replacement.
    pub fn set_cumulative_stats(&mut self, stats: CumulativeStats) {
        if !self.handle.send(AggregatorRequest::ReplaceStats {
            stats: stats.clone(),
        }) {
            self.mark_unavailable();
        }
        self.pending.clear();
        self.cache = stats;
        self.cache.ensure(&self.episodes_key);
        self.cache.increment(&self.steps_key, self.unforwarded_steps);
    }

    fn forward(
        &mut self,
        episodes: u64,
        request: impl FnOnce(u64, oneshot::Sender<StatsReply>) -> AggregatorRequest,
    ) {
        if self.pending.len() >= self.config.max_backlog {
            self.drain();
        }
        let step_delta = std::mem::take(&mut self.unforwarded_steps);
        let (tx, rx) = oneshot::channel();
        if self.handle.send(request(step_delta, tx)) {
            self.pending.push_back(PendingSync {
                step_delta,
                episodes,
                reply: rx,
            });
        } else {
            self.unforwarded_steps += step_delta;
            self.mark_unavailable();
        }
    }

    /// Take every completed reply off the front of the queue and adopt the
    /// newest one.
    fn drain(&mut self) {
        let mut newest: Option<StatsReply> = None;
        while let Some(front) = self.pending.front_mut() {
            match front.reply.try_recv() {
                Ok(reply) => {
                    self.pending.pop_front();
                    if newest.as_ref().map_or(true, |n| reply.revision > n.revision) {
                        newest = Some(reply);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    self.pending.pop_front();
                    self.mark_unavailable();
                }
            }
        }
        if let Some(reply) = newest {
            self.adopt(reply);
        }
    }

    /// Wait for the oldest request. Cancel-safe: the entry stays queued until
    /// its reply has arrived.
    async fn wait_oldest(&mut self) {
        let Some(front) = self.pending.front_mut() else {
            return;
        };
        let result = (&mut front.reply).await;
        self.pending.pop_front();
        match result {
            Ok(reply) => {
                self.adopt(reply);
                self.drain();
            }
            Err(_) => self.mark_unavailable(),
        }
    }

    fn adopt(&mut self, reply: StatsReply) {
        if reply.revision <= self.baseline_revision {
            return;
        }
        self.baseline_revision = reply.revision;

        let (in_flight_steps, in_flight_episodes) = self
            .pending
            .iter()
            .fold((0, 0), |(s, e), p| (s + p.step_delta, e + p.episodes));
        let mut stats = reply.stats;
        stats.increment(&self.steps_key, self.unforwarded_steps + in_flight_steps);
        stats.increment(&self.episodes_key, in_flight_episodes);

        debug!(
            revision = reply.revision,
            in_flight = self.pending.len(),
            steps = stats.get(&self.steps_key),
            "Adopted aggregator counters"
        );
        self.cache = stats;
    }

    fn mark_unavailable(&mut self) {
        if !self.unavailable {
            self.unavailable = true;
            warn!("Stats aggregator is unavailable; counters will go stale");
        }
    }
}

impl EpisodeLog for RemoteProxy {
    fn episode_type(&self) -> EpisodeType {
        self.handle.episode_type()
    }

    fn add_steps(&mut self, steps: u64) {
        self.cache.increment(&self.steps_key, steps);
        self.unforwarded_steps += steps;
    }

    fn log_episode(&mut self, outcome: EpisodeOutcome, trajectory: Option<Trajectory>) -> Result<()> {
        self.cache.increment(&self.episodes_key, 1);
        self.forward(1, |step_delta, reply| AggregatorRequest::LogEpisode {
            outcome,
            trajectory,
            step_delta,
            reply,
        });
        Ok(())
    }

    fn log_scalars(&mut self, data: MetricMap, step: Option<u64>, tag: Option<&str>) -> Result<()> {
        let tag = tag.map(str::to_string);
        self.forward(0, |step_delta, reply| AggregatorRequest::LogScalars {
            data,
            step,
            tag,
            step_delta,
            reply,
        });
        Ok(())
    }
}
