//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the HTTP surface binds to.
    pub bind_addr: String,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Base URL of the chat-completion provider.
    pub provider_base_url: String,
    /// Maximum chunks in flight per job.
    pub max_concurrency: usize,
    /// Attempts per chunk for rate-limited calls.
    pub max_retries: u32,
    /// Delay before the first rate-limit retry; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Interval between progress snapshots on the SSE stream.
    pub progress_poll_interval: Duration,
    /// No chunk progress for this long while processing flags the job stale.
    pub stale_threshold: Duration,
    /// How long a fetched model catalog stays fresh.
    pub catalog_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            database_path: "data/longform.db".to_string(),
            provider_base_url: "https://openrouter.ai/api/v1".to_string(),
            max_concurrency: 5,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            progress_poll_interval: Duration::from_millis(1500),
            stale_threshold: Duration::from_secs(180), // 3 minutes
            catalog_ttl: Duration::from_secs(3600),    // 1 hour
        }
    }
}

impl EngineConfig {
    /// Build EngineConfig from environment variables, falling back to
    /// defaults. A variable that is present but unparseable is an error
    /// rather than a silent default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: std::env::var("LONGFORM_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: std::env::var("LONGFORM_DB_PATH").unwrap_or(defaults.database_path),
            provider_base_url: std::env::var("LONGFORM_PROVIDER_URL")
                .unwrap_or(defaults.provider_base_url),
            max_concurrency: env_parse("LONGFORM_MAX_CONCURRENCY", defaults.max_concurrency)?,
            max_retries: env_parse("LONGFORM_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: Duration::from_millis(env_parse(
                "LONGFORM_RETRY_BASE_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            progress_poll_interval: Duration::from_millis(env_parse(
                "LONGFORM_POLL_INTERVAL_MS",
                defaults.progress_poll_interval.as_millis() as u64,
            )?),
            stale_threshold: Duration::from_secs(env_parse(
                "LONGFORM_STALE_THRESHOLD_SECS",
                defaults.stale_threshold.as_secs(),
            )?),
            catalog_ttl: Duration::from_secs(env_parse(
                "LONGFORM_CATALOG_TTL_SECS",
                defaults.catalog_ttl.as_secs(),
            )?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
