//! Configuration types for mirrorpool
//!
//! Every section deserializes with defaults so a partial file (or none at
//! all, with environment overrides) yields a usable configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of replication workers
pub const MAX_REPLICATION_WORKERS: usize = 3;

/// Root configuration for mirrorpool
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upload admission limits
    pub admission: AdmissionConfig,
    /// Primary account pool
    pub pool: PoolConfig,
    /// Upload session behaviour
    pub upload: UploadConfig,
    /// Secondary replication
    pub replication: ReplicationConfig,
    /// Read path
    pub read: ReadConfig,
    /// Local storage locations
    pub storage: StorageConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        self.admission.validate()?;
        self.pool.validate()?;
        self.upload.validate()?;
        self.replication.validate()?;
        self.read.validate()?;
        Ok(())
    }
}

/// Where the memory margin for admission comes from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSource {
    /// A fixed number of bytes (`memory_budget_bytes`)
    #[default]
    Fixed,
    /// A fraction of the host's available memory
    System,
}

/// Admission controller configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum concurrent upload sessions across all owners
    pub max_concurrent_uploads: usize,
    /// Maximum concurrent upload sessions per owner
    pub max_uploads_per_owner: usize,
    /// Budget source for the memory margin
    pub budget_source: BudgetSource,
    /// Fixed memory budget (bytes), used with `BudgetSource::Fixed`
    pub memory_budget_bytes: u64,
    /// Share of available host memory, used with `BudgetSource::System`
    pub system_memory_fraction: f64,
    /// Per-upload memory estimate as a fraction of the declared size.
    /// A coarse heuristic; tune against observed load.
    pub memory_estimate_fraction: f64,
    /// Largest declared size accepted (bytes)
    pub max_declared_size_bytes: u64,
    /// How long `initiate_upload` waits for capacity before reporting busy (ms)
    pub acquire_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 64,
            max_uploads_per_owner: 4,
            budget_source: BudgetSource::Fixed,
            memory_budget_bytes: 1024 * 1024 * 1024, // 1 GiB
            system_memory_fraction: 0.5,
            memory_estimate_fraction: 0.1,
            max_declared_size_bytes: 8 * 1024 * 1024 * 1024, // 8 GiB
            acquire_wait_ms: 2_000,
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub const fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    /// Memory reserved for an upload of `declared_size_bytes`, at least 1 byte
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn estimate_memory(&self, declared_size_bytes: u64) -> u64 {
        let estimate = (declared_size_bytes as f64 * self.memory_estimate_fraction).ceil();
        (estimate as u64).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 || self.max_uploads_per_owner == 0 {
            return Err(Error::Configuration(
                "admission limits must be at least 1".to_string(),
            ));
        }
        if !(self.memory_estimate_fraction > 0.0 && self.memory_estimate_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "memory_estimate_fraction must be in (0, 1], got {}",
                self.memory_estimate_fraction
            )));
        }
        if !(self.system_memory_fraction > 0.0 && self.system_memory_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "system_memory_fraction must be in (0, 1], got {}",
                self.system_memory_fraction
            )));
        }
        if self.max_declared_size_bytes == 0 {
            return Err(Error::Configuration(
                "max_declared_size_bytes must be positive".to_string(),
            ));
        }
        if self.budget_source == BudgetSource::Fixed {
            let largest = self.estimate_memory(self.max_declared_size_bytes);
            if largest > self.memory_budget_bytes {
                return Err(Error::Configuration(format!(
                    "max_declared_size_bytes {} needs {largest} bytes of memory budget, \
                     more than memory_budget_bytes {}",
                    self.max_declared_size_bytes, self.memory_budget_bytes
                )));
            }
        }
        Ok(())
    }
}

/// One primary-storage account
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identifier
    pub id: String,
    /// Endpoint URL or root path
    pub endpoint: String,
    /// Account secret
    #[serde(default)]
    pub secret: Option<String>,
    /// Storage quota (bytes)
    pub quota_bytes: u64,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}

/// Account pool and health monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Accounts in the pool
    pub accounts: Vec<AccountConfig>,
    /// Maximum concurrent upload sessions per account
    pub max_sessions_per_account: u32,
    /// Health probe interval (milliseconds)
    pub probe_interval_ms: u64,
    /// Timeout for a single probe (milliseconds)
    pub probe_timeout_ms: u64,
    /// Consecutive failures that make an account unavailable
    pub failure_threshold: u32,
    /// Consecutive successes that make an account healthy again
    pub recovery_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            max_sessions_per_account: 16,
            probe_interval_ms: 10_000,
            probe_timeout_ms: 3_000,
            failure_threshold: 3,
            recovery_threshold: 1,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_sessions_per_account == 0 {
            return Err(Error::Configuration(
                "max_sessions_per_account must be at least 1".to_string(),
            ));
        }
        if self.failure_threshold == 0 || self.recovery_threshold == 0 {
            return Err(Error::Configuration(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.probe_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(Error::Configuration(
                "probe_interval_ms and probe_timeout_ms must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
        }
        Ok(())
    }
}

/// Upload session configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Largest chunk accepted in one transfer call (bytes)
    pub max_chunk_size: usize,
    /// Sessions without activity for this long are terminated (milliseconds)
    pub idle_timeout_ms: u64,
    /// Chunk commands buffered per session
    pub chunk_queue_depth: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 16 * 1024 * 1024, // 16 MiB
            idle_timeout_ms: 5 * 60 * 1000,   // 5 minutes
            chunk_queue_depth: 4,
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 || self.chunk_queue_depth == 0 {
            return Err(Error::Configuration(
                "max_chunk_size and chunk_queue_depth must be positive".to_string(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::Configuration(
                "idle_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replication worker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Concurrent replication workers (1..=3)
    pub workers: usize,
    /// Attempts before an object is marked failed
    pub max_attempts: u32,
    /// Backoff before the second attempt (milliseconds)
    pub base_backoff_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl ReplicationConfig {
    /// Exponential backoff after `attempt` failed attempts, capped
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_REPLICATION_WORKERS).contains(&self.workers) {
            return Err(Error::Configuration(format!(
                "replication workers must be between 1 and {MAX_REPLICATION_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "replication max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read path configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Time allowed to open a stream from one source (milliseconds)
    pub source_timeout_ms: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 10_000,
        }
    }
}

impl ReadConfig {
    #[must_use]
    pub const fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.source_timeout_ms == 0 {
            return Err(Error::Configuration(
                "source_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local storage locations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb metadata database file
    pub metadata_path: PathBuf,
    /// Root directory of the secondary backend
    pub secondary_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("/var/lib/mirrorpool/meta.redb"),
            secondary_root: PathBuf::from("/var/lib/mirrorpool/backup"),
        }
    }
}

/// Network configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address for the caller-facing HTTP API
    pub listen: SocketAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9100)),
        }
    }
}

/// Shutdown configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time to wait for active uploads before cancelling them (milliseconds)
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 30_000,
        }
    }
}

impl ShutdownConfig {
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.pool.recovery_threshold, 1);
        assert_eq!(config.network.listen.port(), 9100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replication_workers_bounded() {
        let mut config = Config::default();
        config.replication.workers = 4;
        assert!(config.validate().is_err());
        config.replication.workers = 0;
        assert!(config.validate().is_err());
        config.replication.workers = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_accounts_rejected() {
        let mut config = Config::default();
        let account = AccountConfig {
            id: "acct-1".into(),
            endpoint: "/tmp/a".into(),
            secret: None,
            quota_bytes: 10,
        };
        config.pool.accounts = vec![account.clone(), account];
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unadmittable_max_size_rejected() {
        let mut config = Config::default();
        config.admission.memory_budget_bytes = 1024;
        config.admission.memory_estimate_fraction = 0.5;
        config.admission.max_declared_size_bytes = 2048;
        assert!(config.validate().is_ok());

        config.admission.max_declared_size_bytes = 2049;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        // The host budget is only known at runtime
        config.admission.budget_source = BudgetSource::System;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = Config::default();
        config.upload.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.probe_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.read.source_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ReplicationConfig {
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..ReplicationConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"admission": {"max_concurrent_uploads": 2}}"#).unwrap();
        assert_eq!(config.admission.max_concurrent_uploads, 2);
        assert_eq!(config.admission.max_uploads_per_owner, 4);
        assert_eq!(config.replication.workers, 2);
    }
}
