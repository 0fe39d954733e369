//! YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.refsync/
//!   config.yaml      (optional; every key has a default)
//! ```
//!
//! As with the rest of the state layout, `load_at(home)` takes an explicit home
//! and `load()` derives it from `dirs::home_dir()`. Tests only use `_at`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::{SupportedVersions, DEFAULT_SOURCE};
use crate::error::ConfigError;

/// Delivery durability tier, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fan-out to connected subscribers only; nothing is persisted.
    BestEffort,
    /// Replayable log with consumer groups and acknowledgements.
    #[default]
    Durable,
}

/// Log output format for the daemon's tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Upper bound on a single broker append.
    pub timeout_ms: u64,
    /// Extra attempts per envelope on the durable tier.
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Change records per envelope.
    pub batch_size: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retries: 3,
            retry_delay_ms: 200,
            batch_size: 1,
        }
    }
}

impl PublishConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Durable log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Soft cap on retained entries.
    pub max_len: usize,
    /// Soft cap on entry age.
    pub max_age_secs: u64,
    /// Unacknowledged entries idle longer than this may be claimed by another member.
    pub claim_timeout_secs: u64,
    /// A consumer group inactive this long no longer holds entries back from trimming.
    pub group_expiry_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            max_age_secs: 7 * 24 * 60 * 60,
            claim_timeout_secs: 60,
            group_expiry_secs: 14 * 24 * 60 * 60,
        }
    }
}

impl BrokerConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn group_expiry(&self) -> Duration {
        Duration::from_secs(self.group_expiry_secs)
    }
}

/// Subscriber settings, shared by every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Concurrent apply workers per consumer.
    pub workers: usize,
    /// Apply attempts per change before dead-lettering.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub reclaim_interval_secs: u64,
    pub dead_letter_capacity: usize,
    pub processing_retention_days: i64,
    pub supported_versions: SupportedVersions,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            reclaim_interval_secs: 30,
            dead_letter_capacity: 1_000,
            processing_retention_days: 30,
            supported_versions: SupportedVersions::default(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `source` stamped on every envelope.
    pub source: String,
    pub tier: Tier,
    pub cycle_interval_secs: u64,
    pub publish: PublishConfig,
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            tier: Tier::default(),
            cycle_interval_secs: 300,
            publish: PublishConfig::default(),
            broker: BrokerConfig::default(),
            consumer: ConsumerConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_interval_secs == 0 {
            return Err(invalid("cycle_interval_secs", "must be at least 1"));
        }
        if self.publish.batch_size == 0 {
            return Err(invalid("publish.batch_size", "must be at least 1"));
        }
        if self.publish.timeout_ms == 0 {
            return Err(invalid("publish.timeout_ms", "must be at least 1"));
        }
        if self.consumer.workers == 0 {
            return Err(invalid("consumer.workers", "must be at least 1"));
        }
        if self.consumer.max_attempts == 0 {
            return Err(invalid("consumer.max_attempts", "must be at least 1"));
        }
        let multiplier = self.consumer.backoff_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(invalid(
                "consumer.backoff_multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        if self.consumer.max_backoff_ms < self.consumer.initial_backoff_ms {
            return Err(invalid(
                "consumer.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        if self.broker.claim_timeout_secs == 0 {
            return Err(invalid("broker.claim_timeout_secs", "must be at least 1"));
        }
        if self.broker.group_expiry_secs < self.broker.max_age_secs {
            return Err(invalid(
                "broker.group_expiry_secs",
                "must not be below max_age_secs",
            ));
        }
        let versions = self.consumer.supported_versions;
        if versions.min_major > versions.max_major {
            return Err(invalid(
                "consumer.supported_versions",
                "min_major exceeds max_major",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// `<home>/.refsync/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".refsync").join("config.yaml")
}

/// Load and validate configuration. A missing file yields defaults.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(source) => return Err(ConfigError::Io { path, source }),
    };
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

/// The user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn write_config(home: &Path, yaml: &str) {
        let path = config_path_at(home);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, yaml).unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().unwrap();
        let config = load_at(home.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.tier, Tier::Durable);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let home = TempDir::new().unwrap();
        write_config(
            home.path(),
            "tier: best_effort\npublish:\n  batch_size: 10\nconsumer:\n  workers: 2\n",
        );
        let config = load_at(home.path()).unwrap();
        assert_eq!(config.tier, Tier::BestEffort);
        assert_eq!(config.publish.batch_size, 10);
        assert_eq!(config.publish.retries, PublishConfig::default().retries);
        assert_eq!(config.consumer.workers, 2);
        assert_eq!(config.consumer.max_attempts, 5);
    }

    #[test]
    fn parse_error_carries_path() {
        let home = TempDir::new().unwrap();
        write_config(home.path(), "tier: [unclosed");
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "got {err}");
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let home = TempDir::new().unwrap();
        write_config(home.path(), "consumer:\n  workers: 0\n");
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "consumer.workers",
                ..
            }
        ));
    }

    #[rstest]
    #[case("consumer:\n  backoff_multiplier: .nan\n", "consumer.backoff_multiplier")]
    #[case("consumer:\n  backoff_multiplier: 0.5\n", "consumer.backoff_multiplier")]
    #[case(
        "consumer:\n  initial_backoff_ms: 500\n  max_backoff_ms: 100\n",
        "consumer.max_backoff_ms"
    )]
    #[case("broker:\n  claim_timeout_secs: 0\n", "broker.claim_timeout_secs")]
    #[case(
        "broker:\n  max_age_secs: 600\n  group_expiry_secs: 60\n",
        "broker.group_expiry_secs"
    )]
    fn unusable_values_are_rejected(#[case] yaml: &str, #[case] expected: &str) {
        let home = TempDir::new().unwrap();
        write_config(home.path(), yaml);
        match load_at(home.path()) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected {expected} to be rejected, got {other:?}"),
        }
    }
}
