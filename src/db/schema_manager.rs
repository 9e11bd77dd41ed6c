use crate::db::schema::SchemaSnapshot;
use crate::db::schema_inspector::SchemaInspector;
use crate::util::background::BackgroundTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Database '{0}' is not configured")]
    NotConfigured(String),

    #[error("Failed to connect to '{database}' for schema inspection: {detail}")]
    Connection { database: String, detail: String },

    #[error("Schema inspection failed for '{database}': {detail}")]
    Inspection { database: String, detail: String },
}

impl SchemaError {
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "DATABASE_NOT_FOUND",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::Inspection { .. } => "SCHEMA_INSPECTION_FAILED",
        }
    }
}

/// Cache state of one configured database.
struct DatabaseSlot {
    inspector: Arc<dyn SchemaInspector>,
    /// Serializes refreshes of this database only.
    refresh_lock: Mutex<()>,
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub name: String,
    pub cached: bool,
    pub table_count: usize,
    pub view_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

/// A struct to cache and manage database schema information
///
/// The set of databases is fixed at construction. Each has its own refresh
/// lock, so refreshing one never blocks reads or refreshes of another, and
/// readers always see either the previous or the new snapshot.
pub struct SchemaManager {
    slots: HashMap<String, DatabaseSlot>,
    refresh_interval: Duration,
    refresh_task: std::sync::Mutex<Option<BackgroundTask>>,
}

impl SchemaManager {
    pub fn new(inspectors: Vec<(String, Arc<dyn SchemaInspector>)>, refresh_interval: Duration) -> Self {
        let slots = inspectors
            .into_iter()
            .map(|(name, inspector)| {
                (
                    name,
                    DatabaseSlot {
                        inspector,
                        refresh_lock: Mutex::new(()),
                        snapshot: RwLock::new(None),
                    },
                )
            })
            .collect();

        Self {
            slots,
            refresh_interval,
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    fn slot(&self, database: &str) -> Result<&DatabaseSlot, SchemaError> {
        self.slots
            .get(database)
            .ok_or_else(|| SchemaError::NotConfigured(database.to_string()))
    }

    /// Connects and loads every configured database. Any failure is fatal.
    /// Starts the periodic refresh loop afterwards when an interval is set.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SchemaError> {
        info!(databases = self.slots.len(), "Initializing schema cache");

        for (name, slot) in &self.slots {
            slot.inspector.connect().await?;
            let _guard = slot.refresh_lock.lock().await;
            let snapshot = slot.inspector.inspect().await?;
            info!(database = %name, tables = snapshot.table_count(), "Schema cached");
            *slot.snapshot.write().await = Some(Arc::new(snapshot));
        }

        self.start_refresh_loop();
        Ok(())
    }

    /// Cached snapshot for `database`, if one has been loaded.
    pub async fn get_schema(&self, database: &str) -> Option<Arc<SchemaSnapshot>> {
        let slot = self.slots.get(database)?;
        slot.snapshot.read().await.clone()
    }

    /// Re-inspects `database` and swaps in the new snapshot. On failure the
    /// previous snapshot stays in place.
    pub async fn refresh_schema(&self, database: &str) -> Result<Arc<SchemaSnapshot>, SchemaError> {
        let slot = self.slot(database)?;
        let _guard = slot.refresh_lock.lock().await;

        debug!(database, "Refreshing schema");
        let snapshot = Arc::new(slot.inspector.inspect().await?);
        *slot.snapshot.write().await = Some(Arc::clone(&snapshot));

        info!(database, tables = snapshot.table_count(), "Schema refreshed");
        Ok(snapshot)
    }

    /// Refreshes every database, logging failures without stopping.
    /// Returns the names that failed.
    pub async fn refresh_all(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for name in self.list_databases() {
            if let Err(e) = self.refresh_schema(&name).await {
                error!(database = %name, error = %e, "Schema refresh failed");
                failed.push(name);
            }
        }
        failed
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn summaries(&self) -> Vec<DatabaseSummary> {
        let mut summaries = Vec::with_capacity(self.slots.len());
        for name in self.list_databases() {
            let snapshot = self.get_schema(&name).await;
            summaries.push(DatabaseSummary {
                cached: snapshot.is_some(),
                table_count: snapshot.as_ref().map_or(0, |s| s.table_count()),
                view_count: snapshot.as_ref().map_or(0, |s| s.views.len()),
                captured_at: snapshot.as_ref().map(|s| s.captured_at),
                name,
            });
        }
        summaries
    }

    fn start_refresh_loop(self: &Arc<Self>) {
        if self.refresh_interval.is_zero() {
            return;
        }

        let manager = Arc::clone(self);
        let task = BackgroundTask::spawn_periodic("schema-refresh", self.refresh_interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                let failed = manager.refresh_all().await;
                if !failed.is_empty() {
                    debug!(failed = failed.len(), "Periodic schema refresh finished with failures");
                }
            }
        });

        let previous = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            tokio::spawn(previous.stop());
        }
    }

    /// Stops the refresh loop and disconnects every inspector.
    pub async fn cleanup(&self) {
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }

        for slot in self.slots.values() {
            slot.inspector.disconnect().await;
        }
        info!("Schema cache shut down");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::schema::fixtures::shop_snapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory inspector that records how many inspections overlap.
    pub struct FakeInspector {
        pub database: String,
        pub delay: Duration,
        pub fail: AtomicBool,
        pub inspections: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakeInspector {
        pub fn new(database: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                database: database.to_string(),
                delay,
                fail: AtomicBool::new(false),
                inspections: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SchemaInspector for FakeInspector {
        async fn connect(&self) -> Result<(), SchemaError> {
            Ok(())
        }

        async fn inspect(&self) -> Result<SchemaSnapshot, SchemaError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inspections.fetch_add(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(SchemaError::Inspection {
                    database: self.database.clone(),
                    detail: "catalog unavailable".to_string(),
                });
            }
            let mut snapshot = shop_snapshot();
            snapshot.database = self.database.clone();
            Ok(snapshot)
        }

        async fn disconnect(&self) {}
    }

    pub fn manager_with(inspectors: &[Arc<FakeInspector>]) -> Arc<SchemaManager> {
        let entries = inspectors
            .iter()
            .map(|i| (i.database.clone(), Arc::clone(i) as Arc<dyn SchemaInspector>))
            .collect();
        Arc::new(SchemaManager::new(entries, Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeInspector, manager_with};
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    #[tokio::test]
    async fn initialize_loads_every_database() {
        let a = FakeInspector::new("a", Duration::ZERO);
        let b = FakeInspector::new("b", Duration::ZERO);
        let manager = manager_with(&[a, b]);

        manager.initialize().await.unwrap();
        assert_eq!(manager.list_databases(), vec!["a", "b"]);
        assert_eq!(manager.get_schema("a").await.unwrap().database, "a");
        assert_eq!(manager.get_schema("b").await.unwrap().table_count(), 3);
        assert!(manager.get_schema("missing").await.is_none());
    }

    #[tokio::test]
    async fn initialize_fails_when_any_database_fails() {
        let broken = FakeInspector::new("broken", Duration::ZERO);
        broken.fail.store(true, Ordering::SeqCst);
        let manager = manager_with(&[broken]);
        assert!(matches!(manager.initialize().await, Err(SchemaError::Inspection { .. })));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let inspector = FakeInspector::new("a", Duration::ZERO);
        let manager = manager_with(&[Arc::clone(&inspector)]);
        manager.initialize().await.unwrap();
        let before = manager.get_schema("a").await.unwrap();

        inspector.fail.store(true, Ordering::SeqCst);
        assert!(manager.refresh_schema("a").await.is_err());
        let after = manager.get_schema("a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        assert_eq!(manager.refresh_all().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn refresh_of_unknown_database_is_rejected() {
        let manager = manager_with(&[FakeInspector::new("a", Duration::ZERO)]);
        assert_eq!(
            manager.refresh_schema("zzz").await.unwrap_err(),
            SchemaError::NotConfigured("zzz".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refreshes_serialize_per_database() {
        let slow = FakeInspector::new("db1", Duration::from_millis(50));
        let fast = FakeInspector::new("db2", Duration::ZERO);
        let manager = manager_with(&[Arc::clone(&slow), Arc::clone(&fast)]);
        manager.initialize().await.unwrap();

        let refreshes: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.refresh_schema("db1").await })
            })
            .collect();

        // db2 stays readable and refreshable while db1 refreshes queue up.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        assert!(manager.get_schema("db1").await.is_some());
        manager.refresh_schema("db2").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));

        for handle in refreshes {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(slow.inspections.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn summaries_report_cache_state() {
        let manager = manager_with(&[FakeInspector::new("a", Duration::ZERO)]);
        let before = manager.summaries().await;
        assert!(!before[0].cached);

        manager.refresh_schema("a").await.unwrap();
        let after = manager.summaries().await;
        assert!(after[0].cached);
        assert_eq!(after[0].table_count, 3);
        assert_eq!(after[0].view_count, 1);
    }
}
