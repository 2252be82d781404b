//! Configuration for the data store.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Data store configuration.
///
/// Defaults suit an application store; tests usually shorten the batching
/// window and backoff.
#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    /// SQLite database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Maximum outbox entries delivered at once
    pub sync_concurrency: usize,
    /// Attempts before a transient service error becomes terminal
    pub sync_max_retries: u32,
    /// First retry delay; doubled per attempt
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// How often the outbox is rescanned without a wake-up
    pub poll_interval: Duration,
    /// How long observers collect changes before emitting
    pub observe_batch_window: Duration,
    /// Changes that force an observer to emit immediately
    pub observe_max_batch: usize,
    /// Capacity of the event hub
    pub event_capacity: usize,
    /// Resolve stale-version conflicts with the conflict policy
    pub auto_resolve_conflicts: bool,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            sync_concurrency: 4,
            sync_max_retries: 10,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            observe_batch_window: Duration::from_secs(2),
            observe_max_batch: 1000,
            event_capacity: 1024,
            auto_resolve_conflicts: true,
        }
    }
}

impl DataStoreConfig {
    /// Load configuration from the environment, reading `.env` if present.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Self {
            database_path: env::var("HARBOR_DATABASE_PATH").ok().map(PathBuf::from),
            sync_concurrency: parse_var("HARBOR_SYNC_CONCURRENCY")?
                .unwrap_or(defaults.sync_concurrency),
            sync_max_retries: parse_var("HARBOR_SYNC_MAX_RETRIES")?
                .unwrap_or(defaults.sync_max_retries),
            backoff_base: parse_millis("HARBOR_BACKOFF_BASE_MS")?.unwrap_or(defaults.backoff_base),
            backoff_max: parse_millis("HARBOR_BACKOFF_MAX_MS")?.unwrap_or(defaults.backoff_max),
            poll_interval: parse_millis("HARBOR_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            observe_batch_window: parse_millis("HARBOR_OBSERVE_BATCH_WINDOW_MS")?
                .unwrap_or(defaults.observe_batch_window),
            observe_max_batch: parse_var("HARBOR_OBSERVE_MAX_BATCH")?
                .unwrap_or(defaults.observe_max_batch),
            event_capacity: parse_var("HARBOR_EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
            auto_resolve_conflicts: parse_var("HARBOR_AUTO_RESOLVE_CONFLICTS")?
                .unwrap_or(defaults.auto_resolve_conflicts),
        }
        .validated()
    }

    /// Builder-style method to store the database in a file.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_sync_concurrency(mut self, sync_concurrency: usize) -> Self {
        self.sync_concurrency = sync_concurrency;
        self
    }

    pub fn with_sync_max_retries(mut self, sync_max_retries: u32) -> Self {
        self.sync_max_retries = sync_max_retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_observe_batching(mut self, window: Duration, max_batch: usize) -> Self {
        self.observe_batch_window = window;
        self.observe_max_batch = max_batch;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn with_auto_resolve_conflicts(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve_conflicts = auto_resolve;
        self
    }

    /// Check values that would stall sync or observers.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.sync_concurrency == 0 {
            return Err(ConfigError::OutOfRange("HARBOR_SYNC_CONCURRENCY"));
        }
        if self.observe_max_batch == 0 {
            return Err(ConfigError::OutOfRange("HARBOR_OBSERVE_MAX_BATCH"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::OutOfRange("HARBOR_EVENT_CAPACITY"));
        }
        Ok(self)
    }

    /// Retry delay after `attempts` failed deliveries.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(None),
    }
}

fn parse_millis(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    OutOfRange(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = DataStoreConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_secs(1));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = DataStoreConfig::default().with_sync_concurrency(0).validated();
        assert!(matches!(result, Err(ConfigError::OutOfRange(_))));
    }

    #[test]
    fn builder_setters() {
        let config = DataStoreConfig::default()
            .with_database_path("/tmp/harbor.db")
            .with_observe_batching(Duration::from_millis(10), 5)
            .with_auto_resolve_conflicts(false);

        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/harbor.db")));
        assert_eq!(config.observe_batch_window, Duration::from_millis(10));
        assert_eq!(config.observe_max_batch, 5);
        assert!(!config.auto_resolve_conflicts);
    }

    #[test]
    fn env_values_are_parsed() {
        env::set_var("HARBOR_TEST_MAX_BATCH", " 25 ");
        env::set_var("HARBOR_TEST_WINDOW_MS", "abc");

        assert_eq!(parse_var::<usize>("HARBOR_TEST_MAX_BATCH").unwrap(), Some(25));
        assert!(parse_var::<usize>("HARBOR_TEST_UNSET").unwrap().is_none());
        assert!(matches!(
            parse_millis("HARBOR_TEST_WINDOW_MS"),
            Err(ConfigError::Invalid { name: "HARBOR_TEST_WINDOW_MS", .. })
        ));
    }
}
