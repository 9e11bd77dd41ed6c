use crate::audit::AuditError;
use crate::db::DbError;
use crate::db::schema_manager::SchemaError;
use crate::llm::LlmError;
use crate::pipeline::executor::ExecutorError;
use crate::pipeline::generator::GenerationError;
use serde_json::{Value, json};
use thiserror::Error;

/// Every failure that can reach the command surface.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("Failed to encode output: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(e) => e.error_code(),
            Self::Llm(e) => e.error_code(),
            Self::Schema(e) => e.error_code(),
            Self::Generation(e) => e.error_code(),
            Self::Executor(e) => e.error_code(),
            Self::Audit(e) => e.error_code(),
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_retryable(),
            Self::Llm(e) => e.is_retryable(),
            Self::Schema(SchemaError::Connection { .. }) => true,
            Self::Generation(GenerationError::AiUnavailable(e)) => e.is_retryable(),
            Self::Executor(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Body printed by the CLI when a command fails.
    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        })
    }
}
