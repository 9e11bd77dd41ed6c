use crate::audit::{AuditEntry, AuditLogWriter, AuditStatus};
use crate::config::QueryConfig;
use crate::db::DbError;
use crate::db::models::QueryResult;
use crate::db::pool_manager::PoolManager;
use crate::db::query_runner::QueryRunner;
use crate::pipeline::generator::{GenerationError, GenerationMethod, QueryGenerator};
use crate::pipeline::result_validator::{ResultValidator, ValidationLevel};
use crate::sql::apply_row_limit;
use r2d2::ManageConnection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Extra wall-clock allowance over the server-side statement timeout before
/// the executor stops waiting.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

const NOT_VALIDATED: &str = "generated SQL was not validated";
const CANCELLED: &str = "request cancelled";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Generated SQL failed validation: {0}")]
    Unvalidated(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl ExecutorError {
    /// Audit status recorded for this failure.
    pub fn status(&self) -> AuditStatus {
        match self {
            ExecutorError::Generation(GenerationError::AiUnavailable(_)) => AuditStatus::AiFailed,
            ExecutorError::Generation(_) | ExecutorError::Unvalidated(_) => AuditStatus::ValidationFailed,
            ExecutorError::Database(_) => AuditStatus::ExecutionFailed,
        }
    }

    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            ExecutorError::Generation(e) => e.error_code(),
            ExecutorError::Unvalidated(_) => "VALIDATION_FAILED",
            ExecutorError::Database(e) => e.error_code(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::Generation(GenerationError::AiUnavailable(e)) => e.is_retryable(),
            ExecutorError::Generation(_) | ExecutorError::Unvalidated(_) => false,
            ExecutorError::Database(e) => e.is_retryable(),
        }
    }
}

/// Per-call overrides. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub limit: Option<usize>,
    pub validate_result: Option<bool>,
    pub validation_level: Option<ValidationLevel>,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_limit: usize,
    pub max_limit: usize,
    pub timeout: Duration,
    pub validate_by_default: bool,
    pub validation_level: ValidationLevel,
}

impl From<&QueryConfig> for ExecutorSettings {
    fn from(config: &QueryConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            timeout: Duration::from_secs(config.max_timeout_secs.max(1)),
            validate_by_default: config.enable_result_validation,
            validation_level: config.validation_level,
        }
    }
}

/// What the audit entry needs to know about a request that may have failed
/// part way.
#[derive(Default)]
struct RequestTrace {
    sql: Option<String>,
    generation_method: Option<GenerationMethod>,
}

/// Holds the audit entry of an in-flight request. Written once on
/// completion, or as a cancelled execution failure if the request future is
/// dropped first.
struct PendingAudit<'a> {
    audit: &'a AuditLogWriter,
    entry: Option<AuditEntry>,
    started: Instant,
    trace: RequestTrace,
}

impl<'a> PendingAudit<'a> {
    fn new(audit: &'a AuditLogWriter, entry: AuditEntry) -> Self {
        Self {
            audit,
            entry: Some(entry),
            started: Instant::now(),
            trace: RequestTrace::default(),
        }
    }

    fn complete(&mut self, outcome: &Result<QueryResult, ExecutorError>) {
        let Some(mut entry) = self.take_entry() else {
            return;
        };
        match outcome {
            Ok(result) => {
                entry.status = AuditStatus::Success;
                entry.row_count = Some(result.row_count);
            }
            Err(e) => {
                entry.status = e.status();
                entry.error_message = Some(e.to_string());
            }
        }
        self.audit.write(entry);
    }

    fn take_entry(&mut self) -> Option<AuditEntry> {
        let mut entry = self.entry.take()?;
        entry.sql = self.trace.sql.take();
        entry.generation_method = self.trace.generation_method;
        entry.execution_time_ms = Some(self.started.elapsed().as_secs_f64() * 1000.0);
        Some(entry)
    }
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.take_entry() {
            warn!(request_id = %entry.request_id, "Request cancelled before completion");
            entry.status = AuditStatus::ExecutionFailed;
            entry.error_message = Some(CANCELLED.to_string());
            self.audit.write(entry);
        }
    }
}

/// Question in, rows out: generation, pooled execution and optional result
/// checks for one request, with one audit entry per call.
pub struct QueryExecutor<M: ManageConnection> {
    generator: Arc<dyn QueryGenerator>,
    pools: Arc<PoolManager<M>>,
    runner: Arc<dyn QueryRunner<M::Connection>>,
    result_validator: Option<Arc<ResultValidator>>,
    audit: Arc<AuditLogWriter>,
    settings: ExecutorSettings,
}

impl<M: ManageConnection> QueryExecutor<M> {
    pub fn new(
        generator: Arc<dyn QueryGenerator>,
        pools: Arc<PoolManager<M>>,
        runner: Arc<dyn QueryRunner<M::Connection>>,
        result_validator: Option<Arc<ResultValidator>>,
        audit: Arc<AuditLogWriter>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            generator,
            pools,
            runner,
            result_validator,
            audit,
            settings,
        }
    }

    /// Effective row limit for a request.
    pub fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.default_limit)
            .clamp(1, self.settings.max_limit.max(1))
    }

    pub async fn execute(
        &self,
        natural_language: &str,
        database: &str,
        options: ExecuteOptions,
    ) -> Result<QueryResult, ExecutorError> {
        let request_id = Uuid::new_v4();
        let mut pending = PendingAudit::new(
            &self.audit,
            AuditEntry::new(request_id, database, natural_language, AuditStatus::ExecutionFailed),
        );

        info!(%request_id, database, "Executing natural language query");
        let outcome = self
            .run(natural_language, database, &options, &mut pending.trace)
            .await;

        match &outcome {
            Ok(result) => {
                info!(%request_id, rows = result.row_count, truncated = result.truncated, "Query succeeded");
            }
            Err(e) => {
                warn!(%request_id, status = %e.status(), error = %e, "Query failed");
            }
        }
        pending.complete(&outcome);

        outcome
    }

    async fn run(
        &self,
        natural_language: &str,
        database: &str,
        options: &ExecuteOptions,
        trace: &mut RequestTrace,
    ) -> Result<QueryResult, ExecutorError> {
        let generated = self.generator.generate(natural_language, database).await?;
        trace.sql = Some(generated.sql.clone());
        trace.generation_method = Some(generated.generation_method);

        if !generated.validated {
            let reason = if generated.warnings.is_empty() {
                NOT_VALIDATED.to_string()
            } else {
                generated.warnings.join(", ")
            };
            return Err(ExecutorError::Unvalidated(reason));
        }

        let limit = self.resolve_limit(options.limit);
        // One extra row tells the runner whether the result was cut short.
        let sql = apply_row_limit(&generated.sql, limit + 1, limit + 1);
        debug!(database, limit, sql = %sql, "Running generated SQL");

        let mut result = self.run_sql(database, sql, limit).await?;
        result.sql = Some(generated.sql);
        result.warnings.extend(generated.warnings);

        let validate = options
            .validate_result
            .unwrap_or(self.settings.validate_by_default);
        if let Some(validator) = self.result_validator.as_ref().filter(|_| validate) {
            let level = options
                .validation_level
                .unwrap_or(self.settings.validation_level);
            let verdict = validator.validate(&result, natural_language, level).await;
            result
                .warnings
                .extend(verdict.suggestions.iter().map(|s| s.as_warning()));
        }

        Ok(result)
    }

    async fn run_sql(&self, database: &str, sql: String, limit: usize) -> Result<QueryResult, DbError> {
        let mut connection = self.pools.acquire(database).await?;
        let runner = Arc::clone(&self.runner);
        let timeout = self.settings.timeout;

        // The connection moves into the blocking task and goes back to its
        // pool when that task finishes, even if we stop waiting for it.
        let task = tokio::task::spawn_blocking(move || runner.run(&mut *connection, &sql, limit, timeout));

        let outcome = match tokio::time::timeout(timeout + TIMEOUT_GRACE, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(DbError::execution(format!("query task failed: {}", e))),
            Err(_) => Err(DbError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            // The statement reached the server, so the database is up.
            Ok(_) | Err(DbError::Execution(_)) => self.pools.report_success(database),
            Err(e) if e.is_connection_failure() => {
                error!(database, error = %e, "Connection failed during execution");
                self.pools.report_connection_failure(database);
            }
            Err(_) => {}
        }
        outcome
    }
}
