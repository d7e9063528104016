//! Episode data types.
//!
//! [`EpisodeOutcome`] is what the environment side hands over when an episode
//! ends; [`EpisodeRecord`] is the normalized form that gets persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LogError, Result};

// ---------------------------------------------------------------------------
// Scalar-or-vector values
// ---------------------------------------------------------------------------

/// A value that is a scalar for single-agent episodes and one entry per agent
/// for multi-agent episodes. Serializes as a bare value or a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerAgent<T> {
    Single(T),
    Multi(Vec<T>),
}

impl<T: Clone> PerAgent<T> {
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }

    /// Number of entries (1 for a scalar).
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::Single(v) => vec![v.clone()],
            Self::Multi(v) => v.clone(),
        }
    }

    /// Apply `f` to every entry, keeping the shape.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> PerAgent<U> {
        match self {
            Self::Single(v) => PerAgent::Single(f(v)),
            Self::Multi(v) => PerAgent::Multi(v.iter().map(f).collect()),
        }
    }
}

/// Per-category side-effect measurements: `category -> (amount, total)`.
pub type SideEffects = BTreeMap<String, (f64, f64)>;

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// One 2-D grid of cell codes.
pub type Grid = Vec<Vec<u16>>;

/// Per-step board and goal frames of one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub board: Vec<Grid>,
    pub goals: Vec<Grid>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, board: Grid, goals: Grid) {
        self.board.push(board);
        self.goals.push(goals);
    }

    /// Number of recorded frames.
    pub fn len(&self) -> usize {
        self.board.len()
    }

    pub fn is_empty(&self) -> bool {
        self.board.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Episode outcome (input)
// ---------------------------------------------------------------------------

/// Final state of one episode, as reported by the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeOutcome {
    /// Title of the level that was played.
    pub level_name: String,
    /// Steps taken (per agent for multi-agent episodes).
    pub length: PerAgent<u64>,
    /// Points collected (per agent for multi-agent episodes).
    pub reward: PerAgent<f64>,
    /// Whether each agent reached the exit.
    pub completed: PerAgent<bool>,
    /// Points available at the start of the level, one entry per agent.
    #[serde(default)]
    pub reward_possible: Vec<f64>,
    /// Points required to open the exit, one entry per agent.
    #[serde(default)]
    pub reward_needed: Vec<f64>,
    /// Agent names; required when `reward` is per agent.
    #[serde(default)]
    pub agent_names: Vec<String>,
    #[serde(default)]
    pub side_effects: Option<SideEffects>,
    /// Minimum performance thresholds of the level (training metrics only).
    #[serde(default)]
    pub min_performance: Option<Vec<f64>>,
    /// Additional environment info, persisted alongside the record.
    #[serde(default)]
    pub info: Map<String, Value>,
}

impl EpisodeOutcome {
    /// A single-agent episode.
    pub fn single(level_name: impl Into<String>, length: u64, reward: f64, completed: bool) -> Self {
        Self {
            level_name: level_name.into(),
            length: PerAgent::Single(length),
            reward: PerAgent::Single(reward),
            completed: PerAgent::Single(completed),
            reward_possible: Vec::new(),
            reward_needed: Vec::new(),
            agent_names: Vec::new(),
            side_effects: None,
            min_performance: None,
            info: Map::new(),
        }
    }

    /// A multi-agent episode; every vector holds one entry per agent.
    pub fn multi(
        level_name: impl Into<String>,
        agent_names: Vec<String>,
        length: Vec<u64>,
        reward: Vec<f64>,
        completed: Vec<bool>,
    ) -> Self {
        Self {
            level_name: level_name.into(),
            length: PerAgent::Multi(length),
            reward: PerAgent::Multi(reward),
            completed: PerAgent::Multi(completed),
            reward_possible: Vec::new(),
            reward_needed: Vec::new(),
            agent_names,
            side_effects: None,
            min_performance: None,
            info: Map::new(),
        }
    }

    pub fn with_reward_possible(mut self, possible: Vec<f64>) -> Self {
        self.reward_possible = possible;
        self
    }

    pub fn with_reward_needed(mut self, needed: Vec<f64>) -> Self {
        self.reward_needed = needed;
        self
    }

    pub fn with_side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = Some(side_effects);
        self
    }

    pub fn with_min_performance(mut self, thresholds: Vec<f64>) -> Self {
        self.min_performance = Some(thresholds);
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Episode record (persisted)
// ---------------------------------------------------------------------------

/// Keys the record owns; `info` entries with these names are ignored.
const RESERVED_KEYS: &[&str] = &[
    "level_name",
    "length",
    "reward",
    "reward_possible",
    "reward_needed",
    "completed",
    "agents",
    "side_effects",
    "time",
];

/// The normalized, persisted form of one episode.
///
/// Either every per-agent field is a scalar (single-agent) or every one is a
/// vector of the same length (multi-agent); `agents` is present exactly in
/// the multi-agent case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub level_name: String,
    pub length: PerAgent<u64>,
    pub reward: PerAgent<f64>,
    pub reward_possible: PerAgent<f64>,
    pub reward_needed: PerAgent<f64>,
    pub completed: PerAgent<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffects>,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EpisodeRecord {
    /// Normalize an outcome, detecting single- vs multi-agent mode from the
    /// shape of `reward`.
    pub fn from_outcome(outcome: EpisodeOutcome, time: DateTime<Utc>) -> Result<Self> {
        let EpisodeOutcome {
            level_name,
            length,
            reward,
            completed,
            reward_possible,
            reward_needed,
            agent_names,
            side_effects,
            min_performance: _,
            mut info,
        } = outcome;

        info.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));

        let (reward_possible, reward_needed, agents) = match &reward {
            PerAgent::Single(_) => {
                if length.is_multi() || completed.is_multi() {
                    return Err(LogError::InvalidRecord(
                        "scalar reward mixed with per-agent length or completion".into(),
                    ));
                }
                // Single-agent levels report the first agent's points.
                (
                    PerAgent::Single(reward_possible.first().copied().unwrap_or(0.0)),
                    PerAgent::Single(reward_needed.first().copied().unwrap_or(0.0)),
                    None,
                )
            }
            PerAgent::Multi(rewards) => {
                let n = rewards.len();
                let check = |field: &str, len: usize| {
                    if len == n {
                        Ok(())
                    } else {
                        Err(LogError::InvalidRecord(format!(
                            "`{field}` has {len} entries but `reward` has {n}"
                        )))
                    }
                };
                match (&length, &completed) {
                    (PerAgent::Multi(l), PerAgent::Multi(c)) => {
                        check("length", l.len())?;
                        check("completed", c.len())?;
                    }
                    _ => {
                        return Err(LogError::InvalidRecord(
                            "per-agent reward mixed with scalar length or completion".into(),
                        ))
                    }
                }
                // Unreported points default to zero, as in single-agent mode.
                let per_agent = |field: &str, values: Vec<f64>| {
                    if values.is_empty() {
                        return Ok(vec![0.0; n]);
                    }
                    check(field, values.len()).map(|()| values)
                };
                let reward_possible = per_agent("reward_possible", reward_possible)?;
                let reward_needed = per_agent("reward_needed", reward_needed)?;
                check("agent_names", agent_names.len())?;
                (
                    PerAgent::Multi(reward_possible),
                    PerAgent::Multi(reward_needed),
                    Some(agent_names),
                )
            }
        };

        Ok(Self {
            level_name,
            length,
            reward,
            reward_possible,
            reward_needed,
            completed,
            agents,
            side_effects,
            time,
            extra: info,
        })
    }

    pub fn is_multi_agent(&self) -> bool {
        self.reward.is_multi()
    }

    pub fn num_agents(&self) -> usize {
        self.reward.len()
    }

    /// Serialize field by field. Fields that cannot be represented in JSON
    /// (non-finite numbers) are left out and reported in the second element.
    pub fn to_json(&self) -> (Map<String, Value>, Vec<LogError>) {
        let mut out = Map::new();
        let mut dropped = Vec::new();

        let mut put = |name: &str, value: std::result::Result<Value, String>| match value {
            Ok(v) => {
                out.insert(name.to_string(), v);
            }
            Err(reason) => dropped.push(LogError::Serialization {
                field: name.to_string(),
                reason,
            }),
        };

        put("level_name", Ok(Value::String(self.level_name.clone())));
        put("length", to_value(&self.length));
        put("reward", finite(&self.reward.to_vec()).and_then(|_| to_value(&self.reward)));
        put(
            "reward_possible",
            finite(&self.reward_possible.to_vec()).and_then(|_| to_value(&self.reward_possible)),
        );
        put(
            "reward_needed",
            finite(&self.reward_needed.to_vec()).and_then(|_| to_value(&self.reward_needed)),
        );
        put("completed", to_value(&self.completed));
        if let Some(agents) = &self.agents {
            put("agents", to_value(agents));
        }
        if let Some(effects) = &self.side_effects {
            let values: Vec<f64> = effects.values().flat_map(|(a, t)| [*a, *t]).collect();
            put("side_effects", finite(&values).and_then(|_| to_value(effects)));
        }
        put("time", to_value(&self.time));
        for (key, value) in &self.extra {
            put(key.as_str(), Ok(value.clone()));
        }

        (out, dropped)
    }
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn finite(values: &[f64]) -> std::result::Result<(), String> {
    match values.iter().find(|v| !v.is_finite()) {
        Some(v) => Err(format!("{v} is not representable in JSON")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn single_agent_collapses_reward_possible() {
        let outcome = EpisodeOutcome::single("append-still", 120, 80.0, true)
            .with_reward_possible(vec![100.0, 40.0])
            .with_reward_needed(vec![50.0, 10.0]);
        let record = EpisodeRecord::from_outcome(outcome, now()).unwrap();

        assert!(!record.is_multi_agent());
        assert_eq!(record.reward_possible, PerAgent::Single(100.0));
        assert_eq!(record.reward_needed, PerAgent::Single(50.0));
        assert!(record.agents.is_none());
    }

    #[test]
    fn multi_agent_keeps_vectors_and_names() {
        let outcome = EpisodeOutcome::multi(
            "duel",
            vec!["A".into(), "B".into()],
            vec![5, 8],
            vec![10.0, 20.0],
            vec![true, false],
        )
        .with_reward_possible(vec![30.0, 30.0])
        .with_reward_needed(vec![5.0, 5.0]);
        let record = EpisodeRecord::from_outcome(outcome, now()).unwrap();

        assert!(record.is_multi_agent());
        assert_eq!(record.num_agents(), 2);
        assert_eq!(record.agents.as_deref(), Some(&["A".to_string(), "B".to_string()][..]));
        assert_eq!(record.reward_possible, PerAgent::Multi(vec![30.0, 30.0]));
    }

    #[test]
    fn multi_agent_without_points_defaults_to_zero() {
        let outcome = EpisodeOutcome::multi(
            "duel",
            vec!["A".into(), "B".into()],
            vec![5, 8],
            vec![10.0, 20.0],
            vec![true, false],
        );
        let record = EpisodeRecord::from_outcome(outcome, now()).unwrap();
        assert_eq!(record.reward_possible, PerAgent::Multi(vec![0.0, 0.0]));
        assert_eq!(record.reward_needed, PerAgent::Multi(vec![0.0, 0.0]));

        let short = EpisodeOutcome::multi(
            "duel",
            vec!["A".into(), "B".into()],
            vec![5, 8],
            vec![10.0, 20.0],
            vec![true, false],
        )
        .with_reward_possible(vec![30.0]);
        assert!(matches!(
            EpisodeRecord::from_outcome(short, now()),
            Err(LogError::InvalidRecord(_))
        ));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let outcome = EpisodeOutcome::multi(
            "duel",
            vec!["A".into(), "B".into()],
            vec![5],
            vec![10.0, 20.0],
            vec![true, false],
        )
        .with_reward_possible(vec![1.0, 1.0])
        .with_reward_needed(vec![1.0, 1.0]);
        let err = EpisodeRecord::from_outcome(outcome, now()).unwrap_err();
        assert!(matches!(err, LogError::InvalidRecord(_)));

        let mut mixed = EpisodeOutcome::single("x", 1, 1.0, true);
        mixed.length = PerAgent::Multi(vec![1, 2]);
        assert!(EpisodeRecord::from_outcome(mixed, now()).is_err());
    }

    #[test]
    fn json_uses_persisted_key_names() {
        let mut effects = SideEffects::new();
        effects.insert("wall".into(), (2.0, 10.0));
        let outcome = EpisodeOutcome::single("lvl", 10, 5.0, false)
            .with_reward_possible(vec![9.0])
            .with_side_effects(effects)
            .with_info("seed", json!(17))
            .with_info("reward", json!("ignored"));
        let record = EpisodeRecord::from_outcome(outcome, now()).unwrap();

        let (map, dropped) = record.to_json();
        assert!(dropped.is_empty());
        assert_eq!(map["level_name"], "lvl");
        assert_eq!(map["reward"], 5.0);
        assert_eq!(map["reward_possible"], 9.0);
        assert_eq!(map["completed"], false);
        assert_eq!(map["side_effects"]["wall"], json!([2.0, 10.0]));
        assert_eq!(map["seed"], 17);
        assert!(map["time"].as_str().unwrap().starts_with("2024-03-01T12:00:00"));
        assert!(!map.contains_key("agents"));
    }

    #[test]
    fn non_finite_field_is_dropped_not_fatal() {
        let outcome = EpisodeOutcome::single("lvl", 10, f64::NAN, true);
        let record = EpisodeRecord::from_outcome(outcome, now()).unwrap();

        let (map, dropped) = record.to_json();
        assert!(!map.contains_key("reward"));
        assert!(map.contains_key("length"));
        assert_eq!(dropped.len(), 1);
        assert!(matches!(&dropped[0], LogError::Serialization { field, .. } if field == "reward"));
    }

    #[test]
    fn per_agent_serializes_untagged() {
        assert_eq!(serde_json::to_value(PerAgent::Single(3u64)).unwrap(), json!(3));
        assert_eq!(
            serde_json::to_value(PerAgent::Multi(vec![true, false])).unwrap(),
            json!([true, false])
        );
        let back: PerAgent<f64> = serde_json::from_value(json!([1.0, 2.0])).unwrap();
        assert_eq!(back.len(), 2);
    }
}
