use crate::audit::{AuditLogWriter, AuditSettings};
use crate::config::{AppConfig, DatabaseTarget};
use crate::db::pg_pool::PgConnectionManager;
use crate::db::pool_manager::{ManagerFactory, PoolManager, PoolSettings};
use crate::db::query_runner::PgQueryRunner;
use crate::db::schema_inspector::{PgSchemaInspector, SchemaInspector};
use crate::db::schema_manager::SchemaManager;
use crate::error::GatewayError;
use crate::llm::LlmManager;
use crate::llm::prompts::PromptBuilder;
use crate::pipeline::executor::{ExecutorSettings, QueryExecutor};
use crate::pipeline::generator::SqlGenerator;
use crate::pipeline::result_validator::ResultValidator;
use crate::sql::SqlValidator;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Everything a command needs, built once at startup and passed by reference.
pub struct AppState {
    pub config: AppConfig,
    pub pools: Arc<PoolManager<PgConnectionManager>>,
    pub schema_manager: Arc<SchemaManager>,
    pub llm: Arc<LlmManager>,
    pub generator: Arc<SqlGenerator>,
    pub executor: QueryExecutor<PgConnectionManager>,
    pub audit: Arc<AuditLogWriter>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Connects to every configured database and starts the background loops.
    pub async fn initialize(config: AppConfig) -> Result<Self, GatewayError> {
        let pool_settings = PoolSettings::from(&config.pool);

        info!("Initializing LLM manager with backend: {}", config.llm.backend);
        let llm = Arc::new(LlmManager::new(&config.llm)?);

        let inspectors: Vec<(String, Arc<dyn SchemaInspector>)> = config
            .databases
            .iter()
            .map(|target| {
                let inspector: Arc<dyn SchemaInspector> =
                    Arc::new(PgSchemaInspector::new(target.clone(), pool_settings.clone()));
                (target.name.clone(), inspector)
            })
            .collect();
        let schema_manager = Arc::new(SchemaManager::new(
            inspectors,
            Duration::from_secs(config.schema_cache.refresh_interval_secs),
        ));
        schema_manager.initialize().await?;

        let factory: ManagerFactory<PgConnectionManager> =
            Arc::new(|target: &DatabaseTarget, settings: &PoolSettings| PgConnectionManager::new(target, settings));
        let pools = Arc::new(PoolManager::new(&config.databases, pool_settings, factory));
        pools.start_health_checks();

        let audit = Arc::new(AuditLogWriter::new(AuditSettings::from(&config.audit)));
        if let Err(e) = audit.start().await {
            error!("Failed to start audit log writer: {}", e);
            pools.close_all().await;
            schema_manager.cleanup().await;
            return Err(e.into());
        }

        let generator = Arc::new(SqlGenerator::new(
            Arc::clone(&schema_manager),
            Arc::clone(&llm),
            SqlValidator::new(config.query.block_system_catalogs),
            PromptBuilder::new(config.schema_cache.max_prompt_tables),
            config.query.max_generation_attempts,
        ));

        let result_validator = Arc::new(ResultValidator::new(&config.result_validation, Some(Arc::clone(&llm))));

        let executor = QueryExecutor::new(
            generator.clone(),
            Arc::clone(&pools),
            Arc::new(PgQueryRunner),
            Some(result_validator),
            Arc::clone(&audit),
            ExecutorSettings::from(&config.query),
        );

        info!(databases = config.databases.len(), "Gateway initialized");

        Ok(Self {
            config,
            pools,
            schema_manager,
            llm,
            generator,
            executor,
            audit,
            startup_time: chrono::Utc::now(),
        })
    }

    /// Flushes the audit log, then stops the background loops and closes every pool.
    pub async fn shutdown(&self) {
        match self.audit.stop().await {
            Ok(written) => info!(entries = written, "Audit log flushed"),
            Err(e) => error!("Final audit flush failed: {}", e),
        }
        self.schema_manager.cleanup().await;
        self.pools.close_all().await;
        info!("Gateway stopped");
    }
}
