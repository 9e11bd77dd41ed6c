pub mod circuit_breaker;
pub mod models;
pub mod pg_pool;
pub mod pool_manager;
pub mod query_runner;
pub mod schema;
pub mod schema_inspector;
pub mod schema_manager;

use thiserror::Error;

/// Failures while acquiring connections or running statements.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Database '{0}' is not configured")]
    DatabaseNotFound(String),

    /// All connections are checked out; transient, does not count against the breaker.
    #[error("Connection pool for '{database}' is exhausted ({max_size} connections in use), retry shortly")]
    PoolExhausted { database: String, max_size: u32 },

    /// The circuit breaker is open for this database.
    #[error("Database '{database}' is temporarily unavailable, retry in {retry_after_secs}s")]
    PoolUnavailable { database: String, retry_after_secs: u64 },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("Query timed out after {millis}ms")]
    Timeout { millis: u64 },
}

impl DbError {
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseNotFound(_) => "DATABASE_NOT_FOUND",
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::PoolUnavailable { .. } => "POOL_UNAVAILABLE",
            Self::Connection(_) => "CONNECTION_FAILED",
            Self::Execution(_) => "QUERY_FAILED",
            Self::Timeout { .. } => "QUERY_TIMEOUT",
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::PoolUnavailable { .. } | Self::Connection(_) | Self::Timeout { .. }
        )
    }

    /// Failures that indicate the database itself is unreachable.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}
