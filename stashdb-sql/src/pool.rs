//! Connection/Pool Manager.
//!
//! [`Db`] is the explicitly constructed service that owns the connection
//! pool, the registered schemas, the converter registry, the ticket
//! generator and the Smart Query Cache. Build one with [`DbBuilder`] at
//! startup and share it behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use stashdb_core::{
    Clock, ConfigError, ConverterRegistry, DbConfig, Dialect, Model, Schema, SchemaRegistry,
    StashResult, SyncPolicy, SystemClock, TicketGenerator,
};
use stashdb_storage::{InMemoryCacheBackend, SmartQueryCache};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;

use crate::error::{pool_error, query_error};
use crate::tickets::PostgresTickets;

// ============================================================================
// BUILDER
// ============================================================================

/// Collects schemas and collaborators, then connects.
pub struct DbBuilder {
    config: DbConfig,
    schemas: SchemaRegistry,
    policy: SyncPolicy,
    converters: Option<Arc<ConverterRegistry>>,
    tickets: Option<Arc<dyn TicketGenerator>>,
    clock: Option<Arc<dyn Clock>>,
    cache: Option<SmartQueryCache>,
}

impl DbBuilder {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            schemas: SchemaRegistry::new(),
            policy: SyncPolicy::default(),
            converters: None,
            tickets: None,
            clock: None,
            cache: None,
        }
    }

    /// Build and register the schema for `M`.
    pub fn register<M: Model>(mut self) -> StashResult<Self> {
        self.schemas.register::<M>()?;
        Ok(self)
    }

    /// Register a schema with no static model type.
    pub fn register_schema(mut self, schema: Schema) -> Self {
        self.schemas.register_schema(schema);
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn converters(mut self, converters: Arc<ConverterRegistry>) -> Self {
        self.converters = Some(converters);
        self
    }

    /// Replace the default sequence-backed ticket generator.
    pub fn tickets(mut self, tickets: Arc<dyn TicketGenerator>) -> Self {
        self.tickets = Some(tickets);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cache(mut self, cache: SmartQueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration against a direct connection, create the
    /// pool, warm it up and verify the database clock.
    pub async fn connect(self) -> StashResult<Db> {
        let config = self.config;
        config.validate()?;
        require_postgres(&config)?;
        check_direct_connection(&config).await?;

        let pool = create_pool(&config)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self.cache.unwrap_or_else(|| {
            let backend = Arc::new(InMemoryCacheBackend::new(self.policy.max_entries_per_bucket));
            SmartQueryCache::new(backend, self.policy.clone(), clock.clone())
        });
        let tickets = self
            .tickets
            .unwrap_or_else(|| Arc::new(PostgresTickets::new(pool.clone(), config.dialect)));
        let reaper = spawn_idle_reaper(pool.clone(), config.idle_test_period);

        let db = Db {
            pool,
            config,
            schemas: Arc::new(self.schemas),
            converters: self.converters.unwrap_or_default(),
            tickets,
            cache,
            clock,
            policy: self.policy,
            reaper,
        };

        db.warm_up().await?;
        db.check_clock_skew().await?;
        tracing::info!(
            target_db = %db.config.display_target(),
            min_pool_size = db.config.min_pool_size,
            max_pool_size = db.config.max_pool_size,
            schemas = db.schemas.len(),
            "Connected to database"
        );
        Ok(db)
    }
}

// ============================================================================
// DB
// ============================================================================

/// Pooled database access plus the per-process state the CRUD Engine needs.
pub struct Db {
    pool: Pool,
    config: DbConfig,
    schemas: Arc<SchemaRegistry>,
    converters: Arc<ConverterRegistry>,
    tickets: Arc<dyn TicketGenerator>,
    cache: SmartQueryCache,
    clock: Arc<dyn Clock>,
    policy: SyncPolicy,
    reaper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("target", &self.config.display_target())
            .field("dialect", &self.config.dialect)
            .field("schemas", &self.schemas.len())
            .finish_non_exhaustive()
    }
}

impl Db {
    pub fn builder(config: DbConfig) -> DbBuilder {
        DbBuilder::new(config)
    }

    /// Connect with no registered schemas and default collaborators.
    pub async fn connect(config: DbConfig) -> StashResult<Self> {
        DbBuilder::new(config).connect().await
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Current pool size, for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn schema<M: Model>(&self) -> StashResult<Arc<Schema>> {
        self.schemas.get::<M>()
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn tickets(&self) -> &Arc<dyn TicketGenerator> {
        &self.tickets
    }

    pub fn cache(&self) -> &SmartQueryCache {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Get a pooled connection, retrying per the configured acquire policy.
    pub async fn get_conn(&self) -> StashResult<Object> {
        let attempts = self.config.acquire_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(err) if attempt < attempts => {
                    tracing::debug!(
                        attempt,
                        attempts,
                        error = %err,
                        "Could not acquire connection; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.acquire_retry_delay).await;
                }
                Err(err) => return Err(pool_error(err)),
            }
        }
    }

    async fn warm_up(&self) -> StashResult<()> {
        let mut held = Vec::with_capacity(self.config.min_pool_size);
        for _ in 0..self.config.min_pool_size {
            held.push(self.get_conn().await?);
        }
        tracing::debug!(connections = held.len(), "Warmed up connection pool");
        Ok(())
    }

    /// Compare the database clock with ours; fail hard beyond the tolerance.
    pub async fn check_clock_skew(&self) -> StashResult<()> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(self.dialect().current_timestamp_query(), &[])
            .await
            .map_err(query_error)?;
        let db_time: DateTime<Utc> = row.try_get("now").map_err(query_error)?;
        verify_clock_skew(db_time, self.clock.now(), self.config.clock_skew_tolerance)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Err with [`ConfigError::ClockSkew`] when the clocks differ by more than
/// `tolerance`.
pub fn verify_clock_skew(
    db_time: DateTime<Utc>,
    local_time: DateTime<Utc>,
    tolerance: Duration,
) -> StashResult<()> {
    let skew = (db_time - local_time).abs();
    let tolerance_secs = i64::try_from(tolerance.as_secs()).unwrap_or(i64::MAX);
    if skew > chrono::Duration::seconds(tolerance_secs) {
        return Err(ConfigError::ClockSkew {
            db_time,
            local_time,
            tolerance_secs,
        }
        .into());
    }
    Ok(())
}

/// The pool speaks the Postgres wire protocol only; MySQL is a DDL target
/// for the generator, never a connection dialect.
fn require_postgres(config: &DbConfig) -> StashResult<()> {
    match config.dialect {
        Dialect::Postgres => Ok(()),
        other => Err(ConfigError::InvalidValue {
            field: "dialect".to_string(),
            value: other.to_string(),
            reason: "connections support postgres only".to_string(),
        }
        .into()),
    }
}

fn direct_config(config: &DbConfig) -> StashResult<tokio_postgres::Config> {
    let mut pg = match &config.url {
        Some(url) => url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "url".to_string(),
                value: "<url>".to_string(),
                reason: e.to_string(),
            })?,
        None => {
            let mut pg = tokio_postgres::Config::new();
            pg.host(&config.host)
                .port(config.port)
                .dbname(&config.dbname)
                .user(&config.user)
                .password(&config.password);
            pg
        }
    };
    pg.connect_timeout(config.connect_timeout);
    Ok(pg)
}

/// Open one unpooled connection and round-trip a trivial query.
async fn check_direct_connection(config: &DbConfig) -> StashResult<()> {
    let connection_error = |e: tokio_postgres::Error| ConfigError::Connection {
        reason: format!("{} ({})", e, config.display_target()),
    };
    let (client, connection) = direct_config(config)?
        .connect(NoTls)
        .await
        .map_err(connection_error)?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Validation connection closed with error");
        }
    });
    let result = client.query_one("SELECT 1 AS one_col", &[]).await;
    drop(client);
    driver.abort();
    result.map_err(connection_error)?;
    Ok(())
}

fn create_pool(config: &DbConfig) -> StashResult<Pool> {
    let mut cfg = Config::new();
    match &config.url {
        Some(url) => cfg.url = Some(url.clone()),
        None => {
            cfg.host = Some(config.host.clone());
            cfg.port = Some(config.port);
            cfg.dbname = Some(config.dbname.clone());
            cfg.user = Some(config.user.clone());
            cfg.password = Some(config.password.clone());
        }
    }
    cfg.connect_timeout = Some(config.connect_timeout);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Verified,
    });
    let mut pool_config = PoolConfig::new(config.max_pool_size);
    pool_config.timeouts.wait = Some(config.connect_timeout);
    pool_config.timeouts.create = Some(config.connect_timeout);
    pool_config.timeouts.recycle = Some(config.connect_timeout);
    cfg.pool = Some(pool_config);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls).map_err(|e| {
        ConfigError::Connection {
            reason: format!("Failed to create pool: {}", e),
        }
        .into()
    })
}

/// Periodically drop connections idle for longer than `idle`.
fn spawn_idle_reaper(pool: Pool, idle: Duration) -> Option<JoinHandle<()>> {
    if idle.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let result = pool.retain(|_, metrics| metrics.last_used() < idle);
            if !result.removed.is_empty() {
                tracing::debug!(
                    removed = result.removed.len(),
                    retained = result.retained,
                    "Closed idle connections"
                );
            }
        }
    }))
}
