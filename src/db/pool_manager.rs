use crate::config::{DatabaseTarget, PoolConfig};
use crate::db::DbError;
use crate::db::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::util::background::BackgroundTask;
use crate::util::retry::{Backoff, RetryPolicy, retry};
use r2d2::{ManageConnection, Pool, PooledConnection};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timing and breaker settings shared by every pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
    pub idle_in_transaction_timeout: Duration,
    pub max_idle: Duration,
    pub health_check_interval: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub reconnect_attempts: u32,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            statement_timeout: Duration::from_millis(config.statement_timeout_ms),
            idle_in_transaction_timeout: Duration::from_millis(config.idle_in_transaction_timeout_ms),
            max_idle: Duration::from_secs(config.max_idle_secs),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
            reconnect_attempts: config.reconnect_attempts,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

/// Builds the r2d2 manager for one database target.
pub type ManagerFactory<M> =
    Arc<dyn Fn(&DatabaseTarget, &PoolSettings) -> Result<M, DbError> + Send + Sync>;

/// One pool and the breaker guarding it. Replaced as a whole on reconnect.
struct PoolEntry<M: ManageConnection> {
    pool: Pool<M>,
    breaker: Arc<CircuitBreaker>,
    last_used: Mutex<Instant>,
}

impl<M: ManageConnection> PoolEntry<M> {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

/// A checked-out connection; returned to its pool when dropped.
pub struct ScopedConnection<M: ManageConnection> {
    database: String,
    connection: PooledConnection<M>,
}

impl<M: ManageConnection> ScopedConnection<M> {
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl<M: ManageConnection> Deref for ScopedConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<M: ManageConnection> DerefMut for ScopedConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub database: String,
    pub connections: u32,
    pub idle_connections: u32,
    pub max_size: u32,
    pub breaker: BreakerState,
}

/// Lazily created connection pools, one per configured database, each behind
/// its own circuit breaker.
pub struct PoolManager<M: ManageConnection> {
    targets: HashMap<String, DatabaseTarget>,
    settings: PoolSettings,
    factory: ManagerFactory<M>,
    pools: RwLock<HashMap<String, Arc<PoolEntry<M>>>>,
    health_task: Mutex<Option<BackgroundTask>>,
}

impl<M: ManageConnection> PoolManager<M> {
    pub fn new(targets: &[DatabaseTarget], settings: PoolSettings, factory: ManagerFactory<M>) -> Self {
        let targets = targets
            .iter()
            .map(|target| (target.name.clone(), target.clone()))
            .collect();

        Self {
            targets,
            settings,
            factory,
            pools: RwLock::new(HashMap::new()),
            health_task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    fn build_entry(&self, target: &DatabaseTarget) -> Result<Arc<PoolEntry<M>>, DbError> {
        let manager = (self.factory)(target, &self.settings)?;
        let max_size = target.max_pool_size.max(1);

        info!(
            database = %target.name,
            min = target.min_pool_size.min(max_size),
            max = max_size,
            "Creating connection pool"
        );

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(target.min_pool_size.min(max_size)))
            .connection_timeout(self.settings.acquire_timeout)
            .idle_timeout(Some(self.settings.max_idle))
            .build_unchecked(manager);

        Ok(Arc::new(PoolEntry {
            pool,
            breaker: Arc::new(CircuitBreaker::new(
                target.name.clone(),
                self.settings.failure_threshold,
                self.settings.reset_timeout,
            )),
            last_used: Mutex::new(Instant::now()),
        }))
    }

    fn entry(&self, database: &str) -> Result<Arc<PoolEntry<M>>, DbError> {
        if let Some(entry) = self.read_pools().get(database) {
            return Ok(Arc::clone(entry));
        }

        let target = self
            .targets
            .get(database)
            .ok_or_else(|| DbError::DatabaseNotFound(database.to_string()))?;

        let mut pools = self.write_pools();
        // Another caller may have created it while we waited for the write lock.
        if let Some(entry) = pools.get(database) {
            return Ok(Arc::clone(entry));
        }
        let entry = self.build_entry(target)?;
        pools.insert(database.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PoolEntry<M>>>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pools(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PoolEntry<M>>>> {
        self.pools.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a connection for `database`.
    ///
    /// Fails immediately with `PoolUnavailable` while the breaker is open.
    /// A timeout with every connection in use is `PoolExhausted` and does not
    /// count against the breaker; any other failure does.
    pub async fn acquire(&self, database: &str) -> Result<ScopedConnection<M>, DbError> {
        let entry = self.entry(database)?;

        if !entry.breaker.try_acquire() {
            return Err(DbError::PoolUnavailable {
                database: database.to_string(),
                retry_after_secs: entry.breaker.retry_after().as_secs().max(1),
            });
        }
        entry.touch();

        let pool = entry.pool.clone();
        let checkout = tokio::task::spawn_blocking(move || pool.get()).await;

        match checkout {
            Ok(Ok(connection)) => {
                entry.breaker.record_checkout();
                debug!(database, "Connection acquired");
                Ok(ScopedConnection {
                    database: database.to_string(),
                    connection,
                })
            }
            Ok(Err(e)) => {
                let state = entry.pool.state();
                let max_size = entry.pool.max_size();
                if state.connections >= max_size && state.idle_connections == 0 {
                    entry.breaker.record_neutral();
                    warn!(database, max_size, "Connection pool exhausted");
                    Err(DbError::PoolExhausted {
                        database: database.to_string(),
                        max_size,
                    })
                } else {
                    entry.breaker.record_failure();
                    error!(database, error = %e, "Failed to acquire connection");
                    Err(DbError::connection(format!("{}: {}", database, e)))
                }
            }
            Err(e) => {
                entry.breaker.record_neutral();
                Err(DbError::connection(format!("{}: checkout task failed: {}", database, e)))
            }
        }
    }

    /// Counts a connection-level failure seen after checkout against the breaker.
    pub fn report_connection_failure(&self, database: &str) {
        if let Some(entry) = self.read_pools().get(database) {
            entry.breaker.record_failure();
        }
    }

    /// A statement reached the database; resets the consecutive failure count.
    pub fn report_success(&self, database: &str) {
        if let Some(entry) = self.read_pools().get(database) {
            entry.breaker.record_success();
        }
    }

    pub fn breaker_state(&self, database: &str) -> Option<BreakerState> {
        self.read_pools().get(database).map(|entry| entry.breaker.state())
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let pools = self.read_pools();
        let mut statuses: Vec<PoolStatus> = pools
            .iter()
            .map(|(name, entry)| {
                let state = entry.pool.state();
                PoolStatus {
                    database: name.clone(),
                    connections: state.connections,
                    idle_connections: state.idle_connections,
                    max_size: entry.pool.max_size(),
                    breaker: entry.breaker.state(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.database.cmp(&b.database));
        statuses
    }

    async fn ping(&self, entry: &Arc<PoolEntry<M>>) -> bool {
        let pool = entry.pool.clone();
        let timeout = self.settings.acquire_timeout;
        // Checkout runs the manager's validity query before handing the connection out.
        matches!(
            tokio::task::spawn_blocking(move || pool.get_timeout(timeout).map(drop)).await,
            Ok(Ok(()))
        )
    }

    /// Pings the pool for `database`; on failure the pool is rebuilt.
    /// Returns whether the database is healthy after the check.
    pub async fn health_check(&self, database: &str) -> Result<bool, DbError> {
        let entry = self.entry(database)?;
        if self.ping(&entry).await {
            entry.breaker.record_success();
            return Ok(true);
        }

        warn!(database, "Health check failed, recreating pool");
        self.reconnect(database).await
    }

    /// Replaces the pool for `database`, probing each fresh pool up to
    /// `reconnect_attempts` times. The last pool built is kept either way so
    /// later acquisitions retry from a clean slate.
    pub async fn reconnect(&self, database: &str) -> Result<bool, DbError> {
        let target = self
            .targets
            .get(database)
            .ok_or_else(|| DbError::DatabaseNotFound(database.to_string()))?;

        let policy = RetryPolicy::new(
            self.settings.reconnect_attempts,
            Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
            },
        );

        let outcome = retry(
            policy,
            "reconnect",
            |attempt, _: Option<&DbError>| async move {
                debug!(database, attempt, "Rebuilding connection pool");
                let entry = self.build_entry(target)?;
                self.write_pools().insert(database.to_string(), Arc::clone(&entry));
                if self.ping(&entry).await {
                    Ok(())
                } else {
                    Err(DbError::connection(format!("{}: reconnect check failed", database)))
                }
            },
            DbError::is_connection_failure,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!(database, "Reconnected");
                Ok(true)
            }
            Err(e) if e.is_connection_failure() => {
                error!(database, error = %e, "Reconnect attempts exhausted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops pools that have not been used for longer than the idle limit.
    /// They are recreated on next use.
    pub fn evict_idle(&self) -> Vec<String> {
        let max_idle = self.settings.max_idle;
        let mut pools = self.write_pools();
        let idle: Vec<String> = pools
            .iter()
            .filter(|(_, entry)| entry.idle_for() > max_idle)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &idle {
            info!(database = %name, "Evicting idle connection pool");
            pools.remove(name);
        }
        idle
    }

    async fn run_health_checks(&self) {
        let evicted = self.evict_idle();
        let active: Vec<String> = self
            .read_pools()
            .keys()
            .filter(|name| !evicted.contains(name))
            .cloned()
            .collect();

        for database in active {
            match self.health_check(&database).await {
                Ok(true) => debug!(database = %database, "Health check passed"),
                Ok(false) => warn!(database = %database, "Database still unhealthy after reconnect"),
                Err(e) => error!(database = %database, error = %e, "Health check error"),
            }
        }
    }

    /// Starts the periodic health check and idle eviction loop.
    pub fn start_health_checks(self: &Arc<Self>) {
        let period = self.settings.health_check_interval;
        if period.is_zero() {
            return;
        }

        let manager = Arc::clone(self);
        let task = BackgroundTask::spawn_periodic("pool-health", period, move || {
            let manager = Arc::clone(&manager);
            async move { manager.run_health_checks().await }
        });

        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            tokio::spawn(previous.stop());
        }
    }

    /// Stops health checks and drops every pool.
    pub async fn close_all(&self) {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }

        let count = {
            let mut pools = self.write_pools();
            let count = pools.len();
            pools.clear();
            count
        };
        info!(pools = count, "Closed all connection pools");
    }
}
