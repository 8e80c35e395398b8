//! Configuration parsing and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the scheduler takes periodic snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Block new transactions and drain immediately
    Eager,
    /// Wait for the open count to reach zero on its own
    #[default]
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub mode: SnapshotMode,

    /// Scheduler period; zero disables the background worker
    #[serde(default = "default_snapshot_interval")]
    pub interval_ms: u64,

    /// A lazy snapshot older than this is taken eagerly
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
}

fn default_snapshot_interval() -> u64 {
    60_000
}

fn default_max_interval() -> u64 {
    600_000
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            mode: SnapshotMode::default(),
            interval_ms: default_snapshot_interval(),
            max_interval_ms: default_max_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    /// Quiet period before batched group changes trigger a refresh
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_debounce() -> u64 {
    1_000
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Engine configuration, usually loaded from `blackboard.yml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackboardConfig {
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Keep prior-publisher history and capture stacks for conflict reports
    #[serde(default)]
    pub publish_diagnostics: bool,

    /// Stamp envelopes with session name and open/close times
    #[serde(default)]
    pub timestamp_envelopes: bool,

    #[serde(default)]
    pub max_rule_rounds: Option<usize>,

    #[serde(default = "default_sweep")]
    pub transaction_sweep_ms: u64,

    #[serde(default)]
    pub addresses: AddressConfig,
}

fn default_sweep() -> u64 {
    10_000
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            snapshot: SnapshotConfig::default(),
            publish_diagnostics: false,
            timestamp_envelopes: false,
            max_rule_rounds: None,
            transaction_sweep_ms: default_sweep(),
            addresses: AddressConfig::default(),
        }
    }
}

impl BlackboardConfig {
    /// Load and validate a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BlackboardConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.debounce_ms < 1_000 {
            return Err(ConfigError::Invalid {
                field: "addresses.debounce_ms",
                reason: format!("{} is below the 1000ms minimum", self.addresses.debounce_ms),
            });
        }
        if self.addresses.cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "addresses.cache_capacity",
                reason: "must be at least 1".into(),
            });
        }
        let snapshot = &self.snapshot;
        if snapshot.interval_ms > 0 && snapshot.max_interval_ms < snapshot.interval_ms {
            return Err(ConfigError::Invalid {
                field: "snapshot.max_interval_ms",
                reason: format!(
                    "{} is shorter than the snapshot interval {}",
                    self.snapshot.max_interval_ms, self.snapshot.interval_ms
                ),
            });
        }
        if self.max_rule_rounds == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_rule_rounds",
                reason: "must be at least 1 when set".into(),
            });
        }
        if self.transaction_sweep_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "transaction_sweep_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Scheduler period, `None` when periodic snapshots are disabled
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot.interval_ms > 0).then(|| Duration::from_millis(self.snapshot.interval_ms))
    }

    pub fn max_snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot.max_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.transaction_sweep_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.addresses.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = BlackboardConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, BlackboardConfig::default());
        assert_eq!(config.snapshot.mode, SnapshotMode::Lazy);
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
snapshot:
  mode: eager
  interval_ms: 5000
  max_interval_ms: 20000
publish_diagnostics: true
timestamp_envelopes: true
max_rule_rounds: 32
addresses:
  debounce_ms: 2500
"#;
        let config = BlackboardConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.snapshot.mode, SnapshotMode::Eager);
        assert_eq!(config.snapshot_interval(), Some(Duration::from_secs(5)));
        assert!(config.publish_diagnostics);
        assert_eq!(config.max_rule_rounds, Some(32));
        assert_eq!(config.addresses.cache_capacity, 256);
    }

    #[test]
    fn test_rejects_short_debounce() {
        let err = BlackboardConfig::from_yaml_str("addresses:\n  debounce_ms: 10\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "addresses.debounce_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_interval_disables_scheduler() {
        let config = BlackboardConfig::from_yaml_str("snapshot:\n  interval_ms: 0\n").unwrap();
        assert_eq!(config.snapshot_interval(), None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestamp_envelopes: true").unwrap();
        let config = BlackboardConfig::from_file(file.path()).unwrap();
        assert!(config.timestamp_envelopes);

        let missing = BlackboardConfig::from_file(Path::new("/nonexistent/blackboard.yml"));
        assert!(matches!(missing, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_yaml_roundtrip_of_defaults() {
        let yaml = BlackboardConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("mode: lazy"));
        let back = BlackboardConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, BlackboardConfig::default());
    }
}
