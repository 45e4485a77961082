//! Connection and protocol configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, Dialect, StashResult, StorageError};

// ============================================================================
// DATABASE CONFIGURATION
// ============================================================================

/// Database connection and pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Full connection URL. Overrides the individual fields when set.
    pub url: Option<String>,
    pub dialect: Dialect,
    /// Connections opened eagerly at startup
    pub min_pool_size: usize,
    /// Maximum pool size
    pub max_pool_size: usize,
    /// Attempts to acquire a pooled connection before failing
    pub acquire_retry_attempts: u32,
    /// Pause between acquire attempts
    pub acquire_retry_delay: Duration,
    /// Idle connections unused for this long are tested and recycled
    pub idle_test_period: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Largest tolerated difference between database and local clocks
    pub clock_skew_tolerance: Duration,
    /// Directory holding user migration files
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "stashdb".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            url: None,
            dialect: Dialect::Postgres,
            min_pool_size: 5,
            max_pool_size: 20,
            acquire_retry_attempts: 10,
            acquire_retry_delay: Duration::from_millis(200),
            idle_test_period: Duration::from_secs(5000),
            connect_timeout: Duration::from_secs(30),
            clock_skew_tolerance: Duration::from_secs(120),
            migrations_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// `[database]` table as it appears in a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDbConfig {
    host: Option<String>,
    port: Option<u16>,
    dbname: Option<String>,
    user: Option<String>,
    password: Option<String>,
    url: Option<String>,
    dialect: Option<Dialect>,
    min_pool_size: Option<usize>,
    max_pool_size: Option<usize>,
    acquire_retry_attempts: Option<u32>,
    acquire_retry_delay_ms: Option<u64>,
    idle_test_period_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    clock_skew_tolerance_secs: Option<u64>,
    migrations_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSyncPolicy {
    cache_ttl_ms: Option<u64>,
    recency_window_ms: Option<u64>,
    sync_interval_ms: Option<u64>,
    lock_timeout_ms: Option<u64>,
    max_entries_per_bucket: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    database: RawDbConfig,
    #[serde(default)]
    sync: RawSyncPolicy,
}

impl DbConfig {
    /// Build a configuration from `STASHDB_DB_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("STASHDB_DB_HOST").unwrap_or(defaults.host),
            port: env_parse("STASHDB_DB_PORT").unwrap_or(defaults.port),
            dbname: std::env::var("STASHDB_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("STASHDB_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("STASHDB_DB_PASSWORD").unwrap_or_default(),
            url: std::env::var("STASHDB_DB_URL").ok().filter(|s| !s.is_empty()),
            dialect: env_parse("STASHDB_DB_DIALECT").unwrap_or(defaults.dialect),
            min_pool_size: env_parse("STASHDB_DB_MIN_POOL_SIZE").unwrap_or(defaults.min_pool_size),
            max_pool_size: env_parse("STASHDB_DB_POOL_SIZE").unwrap_or(defaults.max_pool_size),
            acquire_retry_attempts: env_parse("STASHDB_DB_ACQUIRE_RETRIES")
                .unwrap_or(defaults.acquire_retry_attempts),
            acquire_retry_delay: env_parse("STASHDB_DB_ACQUIRE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_retry_delay),
            idle_test_period: env_parse("STASHDB_DB_IDLE_TEST_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_test_period),
            connect_timeout: env_parse("STASHDB_DB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            clock_skew_tolerance: defaults.clock_skew_tolerance,
            migrations_dir: std::env::var("STASHDB_MIGRATIONS_DIR").ok().map(PathBuf::from),
        }
    }

    /// Parse the `[database]` table of a TOML document. Missing keys keep
    /// their defaults.
    pub fn from_toml_str(source: &str) -> StashResult<Self> {
        Ok(parse_config_file(source)?.0)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> StashResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject configurations that cannot produce a working pool.
    pub fn validate(&self) -> StashResult<()> {
        if self.url.is_none() {
            for (field, value) in [
                ("host", &self.host),
                ("dbname", &self.dbname),
                ("user", &self.user),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::MissingRequired {
                        field: field.to_string(),
                    }
                    .into());
                }
            }
        }
        if self.max_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pool_size".to_string(),
                value: "0".to_string(),
                reason: "max_pool_size must be greater than 0".to_string(),
            }
            .into());
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::InvalidValue {
                field: "min_pool_size".to_string(),
                value: self.min_pool_size.to_string(),
                reason: format!(
                    "min_pool_size must not exceed max_pool_size ({})",
                    self.max_pool_size
                ),
            }
            .into());
        }
        if self.acquire_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "acquire_retry_attempts".to_string(),
                value: "0".to_string(),
                reason: "acquire_retry_attempts must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Connection target for log lines. Never includes the password.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "<url>".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname),
        }
    }
}

// ============================================================================
// SYNC / CACHE POLICY
// ============================================================================

/// Timing constants shared by the Smart Query Cache and the sync protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
    /// Cached results expire after this long.
    pub cache_ttl: Duration,
    /// A recency marker newer than this bypasses cache and forces sync.
    pub recency_window: Duration,
    /// A bucket older than this is re-synced on the next read.
    pub sync_interval: Duration,
    /// Longest wait for a bucket's sync lock before giving up.
    pub lock_timeout: Duration,
    pub max_entries_per_bucket: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15),
            recency_window: Duration::from_secs(15),
            sync_interval: Duration::from_secs(15),
            lock_timeout: Duration::from_secs(10),
            max_entries_per_bucket: 10_000,
        }
    }
}

impl SyncPolicy {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_entries_per_bucket(mut self, max: usize) -> Self {
        self.max_entries_per_bucket = max;
        self
    }

    pub fn recency_window_millis(&self) -> i64 {
        i64::try_from(self.recency_window.as_millis()).unwrap_or(i64::MAX)
    }

    pub fn sync_interval_millis(&self) -> i64 {
        i64::try_from(self.sync_interval.as_millis()).unwrap_or(i64::MAX)
    }

    /// Read the optional `[sync]` table of a TOML document.
    pub fn from_toml_str(source: &str) -> StashResult<Self> {
        Ok(parse_config_file(source)?.1)
    }
}

fn parse_config_file(source: &str) -> StashResult<(DbConfig, SyncPolicy)> {
    let raw: RawConfigFile = toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
        field: "config".to_string(),
        value: "<toml>".to_string(),
        reason: e.to_string(),
    })?;

    let d = DbConfig::default();
    let db = raw.database;
    let config = DbConfig {
        host: db.host.unwrap_or(d.host),
        port: db.port.unwrap_or(d.port),
        dbname: db.dbname.unwrap_or(d.dbname),
        user: db.user.unwrap_or(d.user),
        password: db.password.unwrap_or(d.password),
        url: db.url.filter(|u| !u.is_empty()),
        dialect: db.dialect.unwrap_or(d.dialect),
        min_pool_size: db.min_pool_size.unwrap_or(d.min_pool_size),
        max_pool_size: db.max_pool_size.unwrap_or(d.max_pool_size),
        acquire_retry_attempts: db.acquire_retry_attempts.unwrap_or(d.acquire_retry_attempts),
        acquire_retry_delay: db
            .acquire_retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(d.acquire_retry_delay),
        idle_test_period: db
            .idle_test_period_secs
            .map(Duration::from_secs)
            .unwrap_or(d.idle_test_period),
        connect_timeout: db
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(d.connect_timeout),
        clock_skew_tolerance: db
            .clock_skew_tolerance_secs
            .map(Duration::from_secs)
            .unwrap_or(d.clock_skew_tolerance),
        migrations_dir: db.migrations_dir.or(d.migrations_dir),
    };

    let p = SyncPolicy::default();
    let sync = raw.sync;
    let policy = SyncPolicy {
        cache_ttl: sync.cache_ttl_ms.map(Duration::from_millis).unwrap_or(p.cache_ttl),
        recency_window: sync
            .recency_window_ms
            .map(Duration::from_millis)
            .unwrap_or(p.recency_window),
        sync_interval: sync
            .sync_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(p.sync_interval),
        lock_timeout: sync
            .lock_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(p.lock_timeout),
        max_entries_per_bucket: sync.max_entries_per_bucket.unwrap_or(p.max_entries_per_bucket),
    };
    Ok((config, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DbConfig::default();
        assert_eq!(config.min_pool_size, 5);
        assert_eq!(config.max_pool_size, 20);
        assert_eq!(config.acquire_retry_attempts, 10);
        assert_eq!(config.acquire_retry_delay, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_pool_sizes() {
        let config = DbConfig {
            min_pool_size: 30,
            ..DbConfig::default()
        };
        assert!(config.validate().unwrap_err().is_config());

        let config = DbConfig {
            max_pool_size: 0,
            min_pool_size: 0,
            ..DbConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_host_without_url() {
        let config = DbConfig {
            host: String::new(),
            ..DbConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(crate::StashError::Config(ConfigError::MissingRequired { .. }))
        ));

        let with_url = DbConfig {
            host: String::new(),
            url: Some("postgres://u@db/app".to_string()),
            ..DbConfig::default()
        };
        assert!(with_url.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str() {
        let config = DbConfig::from_toml_str(
            r#"
            [database]
            host = "db.internal"
            dbname = "app"
            dialect = "mysql"
            max_pool_size = 8
            min_pool_size = 2
            acquire_retry_delay_ms = 50
            migrations_dir = "sql"
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.dialect, Dialect::MySql);
        assert_eq!(config.max_pool_size, 8);
        assert_eq!(config.acquire_retry_delay, Duration::from_millis(50));
        assert_eq!(config.migrations_dir, Some(PathBuf::from("sql")));
        assert_eq!(config.port, 5432);
    }

    #[test]
    fn test_from_toml_str_rejects_unknown_keys() {
        let err = DbConfig::from_toml_str("[database]\nhots = \"typo\"\n").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_sync_policy_from_toml() {
        let policy = SyncPolicy::from_toml_str("[sync]\nlock_timeout_ms = 250\n").unwrap();
        assert_eq!(policy.lock_timeout, Duration::from_millis(250));
        assert_eq!(policy.cache_ttl, Duration::from_secs(15));
        assert_eq!(SyncPolicy::default().recency_window_millis(), 15_000);
    }
}
