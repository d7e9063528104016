//! Cumulative episode and step counters.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Monotone counters (`training_episodes`, `training_steps`, ...) for one
/// log directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CumulativeStats(BTreeMap<String, u64>);

impl CumulativeStats {
    /// The counters every run starts with.
    pub fn new() -> Self {
        let mut stats = Self::default();
        for key in ["training_episodes", "training_steps", "testing_episodes"] {
            stats.ensure(key);
        }
        stats
    }

    /// Current value of `key`; unknown counters read as 0.
    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Insert `key` with value 0 unless it already exists.
    pub fn ensure(&mut self, key: &str) {
        self.0.entry(key.to_string()).or_insert(0);
    }

    /// Add `by` to `key` and return the new value.
    pub fn increment(&mut self, key: &str, by: u64) -> u64 {
        let slot = self.0.entry(key.to_string()).or_insert(0);
        *slot = slot.saturating_add(by);
        *slot
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Counter names as dashboard keys: `training_steps` -> `training/steps`.
    pub fn flattened(&self) -> impl Iterator<Item = (String, u64)> + '_ {
        self.0.iter().map(|(k, v)| (k.replace('_', "/"), *v))
    }
}

impl FromIterator<(String, u64)> for CumulativeStats {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Counters shared by every logger writing into the same directory.
pub type SharedStats = Arc<Mutex<CumulativeStats>>;

/// Lock shared counters. Counter updates never leave the map half-written,
/// so a poisoned lock is still safe to read.
pub fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, CumulativeStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stats_have_default_counters() {
        let stats = CumulativeStats::new();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.get("training_steps"), 0);
        assert_eq!(stats.get("benchmark_episodes"), 0);
    }

    #[test]
    fn increment_and_flatten() {
        let mut stats = CumulativeStats::new();
        assert_eq!(stats.increment("training_steps", 5), 5);
        assert_eq!(stats.increment("training_steps", 3), 8);

        let flat: BTreeMap<String, u64> = stats.flattened().collect();
        assert_eq!(flat["training/steps"], 8);
        assert_eq!(flat["testing/episodes"], 0);
    }

    #[test]
    fn ensure_keeps_existing_value() {
        let mut stats = CumulativeStats::default();
        stats.increment("testing_steps", 2);
        stats.ensure("testing_steps");
        assert_eq!(stats.get("testing_steps"), 2);
    }

    #[test]
    fn serializes_as_plain_map() {
        let mut stats = CumulativeStats::default();
        stats.increment("training_episodes", 1);
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"training_episodes":1}"#);
    }
}
