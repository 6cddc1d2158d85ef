//! Configuration loader for the sequencer core.
//!
//! Every section has defaults, so an empty TOML file is a valid config.
//! Selected fields can be overridden with `SEQUENCER_*` environment variables.

use crate::error::ConfigError;
use crate::utils::retry::RetryConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub chain: ChainTimingConfig,
    pub worker: WorkerConfig,
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// How long a registration may wait for a wallet before `PoolExhausted`
    #[serde(default = "default_acquire_wait_ms")]
    pub acquire_wait_ms: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Wallet inventory used to seed an empty pool
    #[serde(default)]
    pub inventory_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainTimingConfig {
    #[serde(default = "default_submission_timeout_ms")]
    pub submission_timeout_ms: u64,
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_required_depth")]
    pub required_depth: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Semaphore limit on wallet pipelines running at once
    #[serde(default = "default_max_concurrent_wallets")]
    pub max_concurrent_wallets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Terminal queue entries older than this are deleted
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

fn default_acquire_wait_ms() -> u64 {
    2_000
}

fn default_lease_ttl_secs() -> u64 {
    900
}

fn default_submission_timeout_ms() -> u64 {
    15_000
}

fn default_confirmation_timeout_ms() -> u64 {
    120_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_polls() -> u32 {
    60
}

fn default_required_depth() -> u32 {
    1
}

fn default_scan_interval_ms() -> u64 {
    200
}

fn default_max_concurrent_wallets() -> usize {
    32
}

fn default_db_path() -> String {
    "sequencer.db".to_string()
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_wait_ms: default_acquire_wait_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            inventory_path: None,
        }
    }
}

impl Default for ChainTimingConfig {
    fn default() -> Self {
        Self {
            submission_timeout_ms: default_submission_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            required_depth: default_required_depth(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            max_concurrent_wallets: default_max_concurrent_wallets(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl ChainTimingConfig {
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl WorkerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl MaintenanceConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        reason: format!("cannot parse '{}'", raw),
    })
}

impl SequencerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```ignore
    /// let config = SequencerConfig::from_path("config/sequencer.toml")?;
    /// ```
    pub fn from_path(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config from {}", path))?;
        Self::from_toml_str(&content).context(format!("Failed to parse config TOML {}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            msg: e.to_string(),
        })
    }

    /// Loads `.env`, then applies `SEQUENCER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        dotenv::dotenv().ok();
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SEQUENCER_DB_PATH") {
            self.store.path = v;
        }
        if let Some(v) = lookup("SEQUENCER_INVENTORY") {
            self.pool.inventory_path = Some(v);
        }
        if let Some(v) = lookup("SEQUENCER_LOG_DIR") {
            self.logging.dir = v;
        }
        if let Some(v) = lookup("SEQUENCER_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("SEQUENCER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SEQUENCER_ACQUIRE_WAIT_MS") {
            self.pool.acquire_wait_ms = parse_var("SEQUENCER_ACQUIRE_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("SEQUENCER_LEASE_TTL_SECS") {
            self.pool.lease_ttl_secs = parse_var("SEQUENCER_LEASE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("SEQUENCER_MAX_CONCURRENT_WALLETS") {
            self.worker.max_concurrent_wallets =
                parse_var("SEQUENCER_MAX_CONCURRENT_WALLETS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, u64); 7] = [
            ("retry.max_attempts", self.retry.max_attempts as u64),
            ("pool.lease_ttl_secs", self.pool.lease_ttl_secs),
            ("chain.submission_timeout_ms", self.chain.submission_timeout_ms),
            ("chain.confirmation_timeout_ms", self.chain.confirmation_timeout_ms),
            ("chain.max_polls", self.chain.max_polls as u64),
            ("chain.required_depth", self.chain.required_depth as u64),
            (
                "worker.max_concurrent_wallets",
                self.worker.max_concurrent_wallets as u64,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_delay_ms".to_string(),
                reason: "must not be below retry.base_delay_ms".to_string(),
            });
        }
        if self.retry.exponential_base < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.exponential_base".to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        if self.store.path.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "store.path".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = SequencerConfig::from_toml_str("").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.chain.required_depth, 1);
        assert_eq!(config.store.path, "sequencer.db");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config = SequencerConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 3
            jitter = false

            [chain]
            submission_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.chain.submission_timeout(), Duration::from_millis(500));
        assert_eq!(config.chain.max_polls, 60);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SEQUENCER_DB_PATH", "/tmp/seq.db"),
            ("SEQUENCER_MAX_ATTEMPTS", "7"),
        ]
        .into_iter()
        .collect();
        let mut config = SequencerConfig::default();
        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.path, "/tmp/seq.db");
        assert_eq!(config.retry.max_attempts, 7);

        let err = config
            .apply_overrides_from(|name| {
                (name == "SEQUENCER_ACQUIRE_WAIT_MS").then(|| "soon".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = SequencerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "retry.max_attempts"
        ));
    }
}
