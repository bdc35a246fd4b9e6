//! Configuration types for spider-dl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Spider behavior configuration (pool sizes, retry budgets)
///
/// Groups the tunables of the per-gallery coordinator. Used as a nested
/// sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// Maximum concurrent download workers per gallery (default: 3)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of decoder tasks per gallery (default: 2)
    #[serde(default = "default_decoders")]
    pub decoders: usize,

    /// Read-ahead window: how many upcoming pages a neighbor-priming request
    /// queues for preload (default: 5)
    #[serde(default = "default_preload_window")]
    pub preload_window: usize,

    /// Content-fetch attempts per page before the page fails (default: 5)
    #[serde(default = "default_attempt_budget")]
    pub attempt_budget: u32,

    /// Consecutive metadata-batch fetches that may fail to yield a token
    /// before the token is marked failed for this session (default: 2)
    #[serde(default = "default_token_failure_budget")]
    pub token_failure_budget: u32,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            decoders: default_decoders(),
            preload_window: default_preload_window(),
            attempt_budget: default_attempt_budget(),
            token_failure_budget: default_token_failure_budget(),
        }
    }
}

/// Storage configuration (permanent directory root, ephemeral cache)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which per-gallery permanent directories are created
    /// (default: "./downloads")
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,

    /// Directory backing the shared ephemeral page cache (default: "./cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Size bound of the ephemeral page cache in bytes (default: 256 MiB)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            cache_dir: default_cache_dir(),
            cache_capacity_bytes: default_cache_capacity(),
        }
    }
}

/// Backoff configuration for delays between content-fetch attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the second attempt (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Ceiling for the backoff delay (default: 8 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for the spider registry
///
/// Fields are organized into logical sub-configs:
/// - [`spider`](SpiderConfig) - pool sizes and retry budgets
/// - [`storage`](StorageConfig) - permanent root and ephemeral cache
/// - [`backoff`](BackoffConfig) - delays between fetch attempts
///
/// Sub-configs are flattened so the serialized form stays unnested.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pool sizes and retry budgets
    #[serde(flatten)]
    pub spider: SpiderConfig,

    /// Permanent directory root and ephemeral cache settings
    #[serde(flatten)]
    pub storage: StorageConfig,

    /// Backoff between content-fetch attempts
    #[serde(flatten)]
    pub backoff: BackoffConfig,
}

impl Config {
    /// Validate cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.spider.workers == 0 {
            return Err(crate::error::Error::Config {
                message: "worker pool size must be at least 1".to_string(),
                key: Some("workers".to_string()),
            });
        }
        if self.spider.decoders == 0 {
            return Err(crate::error::Error::Config {
                message: "decoder pool size must be at least 1".to_string(),
                key: Some("decoders".to_string()),
            });
        }
        if self.spider.attempt_budget == 0 {
            return Err(crate::error::Error::Config {
                message: "attempt budget must be at least 1".to_string(),
                key: Some("attempt_budget".to_string()),
            });
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    3
}

fn default_decoders() -> usize {
    2
}

fn default_preload_window() -> usize {
    5
}

fn default_attempt_budget() -> u32 {
    5
}

fn default_token_failure_budget() -> u32 {
    2
}

fn default_download_root() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_cache_capacity() -> u64 {
    256 * 1024 * 1024
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(8)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = Config::default();
        assert_eq!(config.spider.attempt_budget, 5);
        assert_eq!(config.spider.token_failure_budget, 2);
        assert_eq!(config.spider.workers, 3);
        assert_eq!(config.spider.preload_window, 5);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = Config {
            spider: SpiderConfig {
                workers: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains("worker pool"),
            "error should name the offending setting, got: {err}"
        );
    }

    #[test]
    fn validate_accepts_defaults() {
        Config::default().validate().unwrap();
    }
}
