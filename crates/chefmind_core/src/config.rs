//! Storage configuration and environment overrides.
//!
//! # Responsibility
//! - Hold every tunable of the data-access layer in one value.
//! - Read overrides from `CHEFMIND_*`/`SQLITE_*` environment variables.
//!
//! # Invariants
//! - Unparseable environment values are ignored with a warning; defaults
//!   stay in force.
//! - A pool size of zero disables pooling.

use crate::bootstrap::HostEnvironment;
use crate::db::PragmaOptions;
use crate::retry::RetryPolicy;
use crate::transaction::DEFAULT_TRANSACTION_TIMEOUT;
use log::warn;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_PATH: &str = "data/chefmind.db";
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

pub const ENV_DATABASE_PATH: &str = "CHEFMIND_DATABASE_PATH";
pub const ENV_DATABASE_PATH_FALLBACK: &str = "DATABASE_PATH";
pub const ENV_ENABLE_WAL: &str = "SQLITE_ENABLE_WAL";
pub const ENV_BUSY_TIMEOUT: &str = "SQLITE_BUSY_TIMEOUT";
pub const ENV_POOL_SIZE: &str = "SQLITE_POOL_SIZE";
pub const ENV_STORAGE_HOST: &str = "CHEFMIND_STORAGE_HOST";
pub const ENV_OBJECT_STORE_DIR: &str = "CHEFMIND_OBJECT_STORE_DIR";
pub const ENV_HEALTH_INTERVAL_MS: &str = "CHEFMIND_HEALTH_INTERVAL_MS";
pub const ENV_TX_TIMEOUT_MS: &str = "CHEFMIND_TX_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteSettings {
    pub location: DatabaseLocation,
    pub enable_wal: bool,
    pub busy_timeout: Duration,
    pub pool_size: usize,
    pub pool_acquire_timeout: Duration,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            location: DatabaseLocation::File(PathBuf::from(DEFAULT_DATABASE_PATH)),
            enable_wal: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            pool_size: 0,
            pool_acquire_timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
        }
    }
}

impl SqliteSettings {
    pub fn in_memory() -> Self {
        Self {
            location: DatabaseLocation::Memory,
            enable_wal: false,
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    pub fn pragma_options(&self) -> PragmaOptions {
        PragmaOptions {
            enable_wal: self.enable_wal,
            busy_timeout: self.busy_timeout,
        }
    }
}

/// Object-store availability and persistence on browser-class hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub available: bool,
    pub persist_dir: Option<PathBuf>,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            available: true,
            persist_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Forces the host kind; detected from the build target when `None`.
    pub host: Option<HostEnvironment>,
    pub sqlite: SqliteSettings,
    pub object_store: ObjectStoreSettings,
    /// Background health check period; zero disables the periodic check.
    pub health_check_interval: Duration,
    pub transaction_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: None,
            sqlite: SqliteSettings::default(),
            object_store: ObjectStoreSettings::default(),
            health_check_interval: DEFAULT_HEALTH_INTERVAL,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl StorageConfig {
    /// Defaults with the process environment applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides from `lookup`, which maps variable names to
    /// values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DATABASE_PATH).or_else(|| lookup(ENV_DATABASE_PATH_FALLBACK))
        {
            config.sqlite.location = parse_location(&path);
        }
        if let Some(enable_wal) = parse_env::<bool>(&lookup, ENV_ENABLE_WAL) {
            config.sqlite.enable_wal = enable_wal;
        }
        if let Some(ms) = parse_env::<u64>(&lookup, ENV_BUSY_TIMEOUT) {
            config.sqlite.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_env::<usize>(&lookup, ENV_POOL_SIZE) {
            config.sqlite.pool_size = size;
        }
        if let Some(host) = lookup(ENV_STORAGE_HOST) {
            match HostEnvironment::parse(&host) {
                Some(host) => config.host = Some(host),
                None => warn!(
                    "event=config_env module=config status=ignored key={} value={}",
                    ENV_STORAGE_HOST, host
                ),
            }
        }
        if let Some(dir) = lookup(ENV_OBJECT_STORE_DIR).filter(|dir| !dir.trim().is_empty()) {
            config.object_store.persist_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(ms) = parse_env::<u64>(&lookup, ENV_HEALTH_INTERVAL_MS) {
            config.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>(&lookup, ENV_TX_TIMEOUT_MS) {
            config.transaction_timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_host(mut self, host: HostEnvironment) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_sqlite(mut self, sqlite: SqliteSettings) -> Self {
        self.sqlite = sqlite;
        self
    }

    pub fn with_object_store(mut self, object_store: ObjectStoreSettings) -> Self {
        self.object_store = object_store;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolved_host(&self) -> HostEnvironment {
        self.host.unwrap_or_else(HostEnvironment::detect)
    }
}

fn parse_location(raw: &str) -> DatabaseLocation {
    let trimmed = raw.trim();
    if trimmed == ":memory:" {
        return DatabaseLocation::Memory;
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        return DatabaseLocation::File(path.to_path_buf());
    }
    match std::env::current_dir() {
        Ok(cwd) => DatabaseLocation::File(cwd.join(path)),
        Err(_) => DatabaseLocation::File(path.to_path_buf()),
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                "event=config_env module=config status=ignored key={} value={}",
                key, raw
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DatabaseLocation, StorageConfig, DEFAULT_BUSY_TIMEOUT};
    use crate::bootstrap::HostEnvironment;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config_from(pairs: &[(&str, &str)]) -> StorageConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        StorageConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]);
        assert!(config.sqlite.enable_wal);
        assert_eq!(config.sqlite.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config.sqlite.pool_size, 0);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
        assert!(config.host.is_none());
    }

    #[test]
    fn environment_overrides_are_applied() {
        let config = config_from(&[
            ("DATABASE_PATH", "/var/lib/chefmind/app.db"),
            ("SQLITE_ENABLE_WAL", "false"),
            ("SQLITE_BUSY_TIMEOUT", "2500"),
            ("SQLITE_POOL_SIZE", "4"),
            ("CHEFMIND_STORAGE_HOST", "browser"),
            ("CHEFMIND_TX_TIMEOUT_MS", "1000"),
        ]);
        assert_eq!(
            config.sqlite.location,
            DatabaseLocation::File(PathBuf::from("/var/lib/chefmind/app.db"))
        );
        assert!(!config.sqlite.enable_wal);
        assert_eq!(config.sqlite.busy_timeout, Duration::from_millis(2500));
        assert_eq!(config.sqlite.pool_size, 4);
        assert_eq!(config.host, Some(HostEnvironment::Browser));
        assert_eq!(config.transaction_timeout, Duration::from_secs(1));
    }

    #[test]
    fn primary_path_variable_wins_and_bad_values_are_ignored() {
        let config = config_from(&[
            ("CHEFMIND_DATABASE_PATH", ":memory:"),
            ("DATABASE_PATH", "/tmp/ignored.db"),
            ("SQLITE_POOL_SIZE", "many"),
        ]);
        assert_eq!(config.sqlite.location, DatabaseLocation::Memory);
        assert_eq!(config.sqlite.pool_size, 0);
    }
}
