//! Tracker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_entity_timeout_ms() -> u64 {
    // One hour, matching the classic host-table aging default.
    60 * 60 * 1000
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

fn default_max_learn_attempts() -> u32 {
    32
}

/// Tunables of the tracking engine. All fields have defaults, so a partial
/// (or empty) config file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How long an entity may go unseen before the expiration sweep drops
    /// it, in milliseconds.
    pub entity_timeout_ms: u64,

    /// Delay between expiration sweep runs, in seconds. The next run is
    /// scheduled only after the previous one finishes.
    pub cleanup_interval_secs: u64,

    /// Upper bound on optimistic retries of one learn attempt before it is
    /// abandoned with an error. A failed conditional update means another
    /// writer made progress, so hitting this cap indicates either extreme
    /// contention or an index-consistency bug.
    pub max_learn_attempts: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            entity_timeout_ms: default_entity_timeout_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_learn_attempts: default_max_learn_attempts(),
        }
    }
}

impl TrackerConfig {
    pub fn entity_timeout(&self) -> Duration {
        Duration::from_millis(self.entity_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.entity_timeout_ms, 3_600_000);
        assert_eq!(config.cleanup_interval_secs, 3_600);
        assert_eq!(config.max_learn_attempts, 32);
    }

    #[test]
    fn test_partial_config_file() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{"entity_timeout_ms": 1000}"#).unwrap();
        assert_eq!(config.entity_timeout_ms, 1_000);
        assert_eq!(config.max_learn_attempts, 32);
    }
}
