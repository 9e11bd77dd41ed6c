use crate::config::DatabaseTarget;
use crate::db::pg_pool::PgConnectionManager;
use crate::db::pool_manager::PoolSettings;
use crate::db::schema::{ColumnSchema, ForeignKeySchema, IndexSchema, SchemaSnapshot, TableSchema};
use crate::db::schema_manager::SchemaError;
use async_trait::async_trait;
use postgres::Client;
use r2d2::Pool;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, info};

/// Reads the structure of one database.
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    async fn connect(&self) -> Result<(), SchemaError>;
    async fn inspect(&self) -> Result<SchemaSnapshot, SchemaError>;
    async fn disconnect(&self);
}

/// Catalog reader for the `public` schema of a PostgreSQL database, using a
/// small pool of its own so introspection never competes with user queries.
pub struct PgSchemaInspector {
    target: DatabaseTarget,
    settings: PoolSettings,
    pool: Mutex<Option<Pool<PgConnectionManager>>>,
}

impl PgSchemaInspector {
    pub fn new(target: DatabaseTarget, settings: PoolSettings) -> Self {
        Self {
            target,
            settings,
            pool: Mutex::new(None),
        }
    }

    fn current_pool(&self) -> Option<Pool<PgConnectionManager>> {
        self.pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn inspection_error(&self, detail: impl std::fmt::Display) -> SchemaError {
        SchemaError::Inspection {
            database: self.target.name.clone(),
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl SchemaInspector for PgSchemaInspector {
    async fn connect(&self) -> Result<(), SchemaError> {
        let manager = PgConnectionManager::new(&self.target, &self.settings)
            .map_err(|e| self.inspection_error(e))?;
        let timeout = self.settings.acquire_timeout;

        let pool = tokio::task::spawn_blocking(move || {
            Pool::builder()
                .max_size(2)
                .min_idle(Some(0))
                .connection_timeout(timeout)
                .build(manager)
        })
        .await
        .map_err(|e| self.inspection_error(e))?
        .map_err(|e| SchemaError::Connection {
            database: self.target.name.clone(),
            detail: e.to_string(),
        })?;

        *self.pool.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pool);
        info!(database = %self.target.name, "Schema inspector connected");
        Ok(())
    }

    async fn inspect(&self) -> Result<SchemaSnapshot, SchemaError> {
        let pool = self.current_pool().ok_or_else(|| SchemaError::Connection {
            database: self.target.name.clone(),
            detail: "schema inspector is not connected".to_string(),
        })?;
        let database = self.target.name.clone();

        let snapshot = tokio::task::spawn_blocking(move || -> Result<SchemaSnapshot, String> {
            let mut client = pool.get().map_err(|e| e.to_string())?;
            read_snapshot(&mut client, &database).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| self.inspection_error(e))?
        .map_err(|e| self.inspection_error(e))?;

        info!(
            database = %self.target.name,
            tables = snapshot.table_count(),
            views = snapshot.views.len(),
            "Schema inspection complete"
        );
        Ok(snapshot)
    }

    async fn disconnect(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if pool.is_some() {
            debug!(database = %self.target.name, "Schema inspector disconnected");
        }
    }
}

const SCHEMA: &str = "public";

fn read_snapshot(client: &mut Client, database: &str) -> Result<SchemaSnapshot, postgres::Error> {
    let table_names: Vec<String> = client
        .query(
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_schema = $1::text AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            &[&SCHEMA],
        )?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let views: Vec<String> = client
        .query(
            "SELECT table_name::text FROM information_schema.views
             WHERE table_schema = $1::text ORDER BY table_name",
            &[&SCHEMA],
        )?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        let primary_keys = read_primary_keys(client, &name)?;
        let columns = read_columns(client, &name, &primary_keys)?;
        let indexes = read_indexes(client, &name)?;
        let foreign_keys = read_foreign_keys(client, &name)?;
        let row_count_estimate = read_row_estimate(client, &name)?;

        debug!(table = %name, columns = columns.len(), "Inspected table");
        tables.push(TableSchema {
            name,
            columns,
            indexes,
            foreign_keys,
            row_count_estimate,
        });
    }

    Ok(SchemaSnapshot::new(database, tables, views))
}

fn read_primary_keys(client: &mut Client, table: &str) -> Result<HashSet<String>, postgres::Error> {
    let rows = client.query(
        "SELECT kcu.column_name::text
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
         WHERE tc.constraint_type = 'PRIMARY KEY'
           AND tc.table_schema = $1::text
           AND tc.table_name = $2::text",
        &[&SCHEMA, &table],
    )?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

fn read_columns(
    client: &mut Client,
    table: &str,
    primary_keys: &HashSet<String>,
) -> Result<Vec<ColumnSchema>, postgres::Error> {
    let rows = client.query(
        "SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
         FROM information_schema.columns
         WHERE table_schema = $1::text AND table_name = $2::text
         ORDER BY ordinal_position",
        &[&SCHEMA, &table],
    )?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let is_nullable: String = row.get(2);
            ColumnSchema {
                primary_key: primary_keys.contains(&name),
                name,
                data_type: row.get(1),
                nullable: is_nullable == "YES",
                default_value: row.get(3),
            }
        })
        .collect())
}

fn read_indexes(client: &mut Client, table: &str) -> Result<Vec<IndexSchema>, postgres::Error> {
    let rows = client.query(
        "SELECT i.relname::text,
                ix.indisunique,
                am.amname::text,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum))
         FROM pg_class t
         JOIN pg_namespace n ON n.oid = t.relnamespace
         JOIN pg_index ix ON ix.indrelid = t.oid
         JOIN pg_class i ON i.oid = ix.indexrelid
         JOIN pg_am am ON am.oid = i.relam
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
         WHERE n.nspname = $1::text AND t.relname = $2::text AND NOT ix.indisprimary
         GROUP BY i.relname, ix.indisunique, am.amname
         ORDER BY i.relname",
        &[&SCHEMA, &table],
    )?;

    Ok(rows
        .iter()
        .map(|row| IndexSchema {
            name: row.get(0),
            unique: row.get(1),
            index_type: row.get(2),
            columns: row.get(3),
        })
        .collect())
}

fn read_foreign_keys(client: &mut Client, table: &str) -> Result<Vec<ForeignKeySchema>, postgres::Error> {
    let rows = client.query(
        "SELECT tc.constraint_name::text,
                kcu.column_name::text,
                ccu.table_name::text AS foreign_table,
                ccu.column_name::text AS foreign_column
         FROM information_schema.table_constraints AS tc
         JOIN information_schema.key_column_usage AS kcu
           ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
         JOIN information_schema.constraint_column_usage AS ccu
           ON ccu.constraint_name = tc.constraint_name
          AND ccu.table_schema = tc.table_schema
         WHERE tc.constraint_type = 'FOREIGN KEY'
           AND tc.table_schema = $1::text
           AND tc.table_name = $2::text
         ORDER BY tc.constraint_name, kcu.ordinal_position",
        &[&SCHEMA, &table],
    )?;

    Ok(rows
        .iter()
        .map(|row| ForeignKeySchema {
            name: row.get(0),
            column: row.get(1),
            foreign_table: row.get(2),
            foreign_column: row.get(3),
        })
        .collect())
}

fn read_row_estimate(client: &mut Client, table: &str) -> Result<Option<i64>, postgres::Error> {
    let row = client.query_opt(
        "SELECT c.reltuples::bigint
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1::text AND c.relname = $2::text",
        &[&SCHEMA, &table],
    )?;
    // reltuples is -1 for tables that were never analyzed.
    Ok(row.map(|r| r.get::<_, i64>(0)).filter(|n| *n >= 0))
}
