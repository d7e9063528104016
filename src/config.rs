use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LogError, Result};
use crate::stats::CumulativeStats;

// ---------------------------------------------------------------------------
// Episode types
// ---------------------------------------------------------------------------

/// Which kind of episodes a logger records. Each type owns its own log file
/// and its own `{type}_episodes` / `{type}_steps` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    Training,
    Testing,
    Benchmark,
}

impl EpisodeType {
    pub const ALL: [EpisodeType; 3] = [Self::Training, Self::Testing, Self::Benchmark];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Testing => "testing",
            Self::Benchmark => "benchmark",
        }
    }

    /// Counter incremented once per logged episode.
    pub fn episodes_key(&self) -> String {
        format!("{}_episodes", self.as_str())
    }

    /// Counter incremented once per environment step.
    pub fn steps_key(&self) -> String {
        format!("{}_steps", self.as_str())
    }
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `name` is one of the `{type}_episodes` / `{type}_steps` counters.
pub fn is_known_counter(name: &str) -> bool {
    EpisodeType::ALL
        .iter()
        .any(|t| name == t.episodes_key() || name == t.steps_key())
}

// ---------------------------------------------------------------------------
// Video name template
// ---------------------------------------------------------------------------

/// A substitution variable accepted in video name templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateVar {
    /// `{level_name}` -- the title of the level that was played.
    LevelName,
    /// `{episode_type}` -- `training`, `testing` or `benchmark`.
    EpisodeType,
    /// Any cumulative counter, e.g. `{training_steps}`.
    Counter(String),
}

impl TemplateVar {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "level_name" => Ok(Self::LevelName),
            "episode_type" => Ok(Self::EpisodeType),
            counter if is_known_counter(counter) => Ok(Self::Counter(counter.to_string())),
            other => Err(LogError::Config(format!(
                "unknown video name variable `{{{other}}}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(TemplateVar),
}

/// A parsed video file name template such as `train-s{training_steps}-{level_name}`.
///
/// Parsing rejects unknown variables and unbalanced braces up front, so
/// [`VideoNameTemplate::render`] never fails. `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoNameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl VideoNameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(LogError::Config(format!(
                                    "unterminated variable in video name template `{template}`"
                                )))
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(TemplateVar::parse(name.trim())?));
                }
                '}' => {
                    return Err(LogError::Config(format!(
                        "unmatched `}}` in video name template `{template}`"
                    )))
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The variables referenced by this template, in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &TemplateVar> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var(v) => Some(v),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every variable. Counters missing from `stats` render as 0.
    pub fn render(
        &self,
        level_name: &str,
        episode_type: EpisodeType,
        stats: &CumulativeStats,
    ) -> String {
        let mut out = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(TemplateVar::LevelName) => out.push_str(level_name),
                Segment::Var(TemplateVar::EpisodeType) => out.push_str(episode_type.as_str()),
                Segment::Var(TemplateVar::Counter(name)) => {
                    out.push_str(&stats.get(name).to_string())
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Logger configuration
// ---------------------------------------------------------------------------

/// Connection details for an external experiment tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base URL of the tracker's ingestion API.
    pub endpoint: String,
    /// Project the run is filed under.
    pub project: String,
    /// Optional human-readable run name (defaults to the log directory name).
    #[serde(default)]
    pub run_name: Option<String>,
    /// Optional bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Which metrics backends a logger attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Write TensorBoard event files into the log directory.
    pub tensorboard: bool,
    /// Write `metrics.jsonl` into the log directory.
    pub jsonl: bool,
    /// Forward metrics to an experiment tracker.
    pub tracker: Option<TrackerConfig>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            tensorboard: true,
            jsonl: false,
            tracker: None,
        }
    }
}

impl SinkConfig {
    /// No backends at all.
    pub fn none() -> Self {
        Self {
            tensorboard: false,
            jsonl: false,
            tracker: None,
        }
    }
}

/// Complete configuration for one [`EpisodeLogger`](crate::episode::EpisodeLogger).
///
/// When deserialized, omitted fields take the defaults of the configured
/// `episode_type`, so a testing config never inherits the training log name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "LoggerConfigFile")]
pub struct LoggerConfig {
    /// Directory for the episode log, metrics and videos. `None` disables all
    /// file output; counters and metric pushes still work.
    pub logdir: Option<PathBuf>,
    pub episode_type: EpisodeType,
    /// File name of the episode log inside `logdir`.
    pub episode_logname: Option<String>,
    /// Video file name template; `None` disables recordings.
    pub video_name: Option<String>,
    /// Record every N-th episode (1-based episodes 1, N+1, 2N+1, ...). 0 disables.
    pub video_interval: u64,
    /// Container passed to the renderer (default: "mp4").
    pub movie_format: String,
    pub sinks: SinkConfig,
}

/// On-disk form of [`LoggerConfig`]. `Some(None)` is an explicit `null`,
/// which disables the log file or recordings; a missing key is `None`.
#[derive(Deserialize)]
struct LoggerConfigFile {
    #[serde(default)]
    logdir: Option<PathBuf>,
    #[serde(default)]
    episode_type: Option<EpisodeType>,
    #[serde(default, deserialize_with = "present")]
    episode_logname: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    video_name: Option<Option<String>>,
    #[serde(default)]
    video_interval: Option<u64>,
    #[serde(default)]
    movie_format: Option<String>,
    #[serde(default)]
    sinks: Option<SinkConfig>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl From<LoggerConfigFile> for LoggerConfig {
    fn from(file: LoggerConfigFile) -> Self {
        let defaults = Self::for_episode_type(file.episode_type.unwrap_or(EpisodeType::Training));
        Self {
            logdir: file.logdir,
            episode_type: defaults.episode_type,
            episode_logname: file.episode_logname.unwrap_or(defaults.episode_logname),
            video_name: file.video_name.unwrap_or(defaults.video_name),
            video_interval: file.video_interval.unwrap_or(defaults.video_interval),
            movie_format: file.movie_format.unwrap_or(defaults.movie_format),
            sinks: file.sinks.unwrap_or(defaults.sinks),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self::for_episode_type(EpisodeType::Training)
    }
}

impl LoggerConfig {
    /// Defaults for each episode type. `logdir` is left unset.
    pub fn for_episode_type(episode_type: EpisodeType) -> Self {
        let (logname, video, interval) = match episode_type {
            EpisodeType::Training => (
                "training-log.json",
                "train-s{training_steps}-{level_name}",
                100,
            ),
            EpisodeType::Testing => ("testing-log.json", "test-s{training_steps}-{level_name}", 1),
            EpisodeType::Benchmark => ("benchmark-data.json", "benchmark-{level_name}", 1),
        };
        Self {
            logdir: None,
            episode_type,
            episode_logname: Some(logname.into()),
            video_name: Some(video.into()),
            video_interval: interval,
            movie_format: "mp4".into(),
            sinks: SinkConfig::default(),
        }
    }

    pub fn with_logdir(mut self, logdir: impl Into<PathBuf>) -> Self {
        self.logdir = Some(logdir.into());
        self
    }

    pub fn with_sinks(mut self, sinks: SinkConfig) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_video(mut self, name: Option<&str>, interval: u64) -> Self {
        self.video_name = name.map(str::to_string);
        self.video_interval = interval;
        self
    }

    /// Parse the configured video template, if any.
    pub fn video_template(&self) -> Result<Option<VideoNameTemplate>> {
        self.video_name
            .as_deref()
            .map(VideoNameTemplate::parse)
            .transpose()
    }

    /// Reject invalid or contradictory options.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.episode_logname {
            if name.trim().is_empty() {
                return Err(LogError::Config("episode log name is empty".into()));
            }
            if name.contains(['/', '\\']) {
                return Err(LogError::Config(format!(
                    "episode log name `{name}` must be a bare file name"
                )));
            }
        }

        self.video_template()?;

        if self.movie_format.trim().is_empty() {
            return Err(LogError::Config("movie format is empty".into()));
        }

        if self.logdir.is_none() && (self.sinks.tensorboard || self.sinks.jsonl) {
            return Err(LogError::Config(
                "file-based metrics sinks require a log directory".into(),
            ));
        }

        if let Some(tracker) = &self.sinks.tracker {
            if tracker.endpoint.trim().is_empty() {
                return Err(LogError::Config("tracker endpoint is empty".into()));
            }
            if tracker.project.trim().is_empty() {
                return Err(LogError::Config("tracker project is empty".into()));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Proxy configuration
// ---------------------------------------------------------------------------

/// Tuning for [`RemoteProxy`](crate::stats::RemoteProxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Outstanding requests allowed before reads start blocking (default: 50).
    pub max_backlog: usize,
    /// Minimum time between two drains of completed requests (default: 10ms).
    pub poll_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_backlog: 50,
            poll_interval_ms: 10,
        }
    }
}

impl ProxyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_backlog == 0 {
            return Err(LogError::Config("proxy backlog must be at least 1".into()));
        }
        Ok(())
    }
}
