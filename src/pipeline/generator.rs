use crate::db::schema_manager::SchemaManager;
use crate::llm::prompts::PromptBuilder;
use crate::llm::{LlmError, LlmManager};
use crate::sql::SqlValidator;
use crate::util::retry::{Backoff, RetryPolicy, retry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Database '{0}' not found or schema not cached")]
    SchemaNotFound(String),

    #[error("Failed to generate valid SQL after {attempts} attempts. Validation errors: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("AI service unavailable: {0}")]
    AiUnavailable(#[source] LlmError),
}

impl GenerationError {
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            Self::Exhausted { .. } => "GENERATION_EXHAUSTED",
            Self::AiUnavailable(_) => "AI_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    /// Accepted on the first attempt.
    AiGenerated,
    /// Accepted after at least one rejected attempt.
    RetryGenerated,
    TemplateMatched,
}

impl fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationMethod::AiGenerated => write!(f, "ai_generated"),
            GenerationMethod::RetryGenerated => write!(f, "retry_generated"),
            GenerationMethod::TemplateMatched => write!(f, "template_matched"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub validated: bool,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub assumptions: Vec<String>,
    pub generation_method: GenerationMethod,
    pub generated_at: DateTime<Utc>,
}

/// Turns a question into SQL for one database.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn generate(&self, natural_language: &str, database: &str) -> Result<GeneratedQuery, GenerationError>;
}

/// Why one attempt did not produce usable SQL.
#[derive(Debug)]
enum AttemptError {
    Rejected(Vec<String>),
    Ai(LlmError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Rejected(_))
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Rejected(errors) => write!(f, "validation failed: {}", errors.join("; ")),
            AttemptError::Ai(e) => write!(f, "{}", e),
        }
    }
}

/// Randomness grows with each retry so a repeated bad answer can change.
fn attempt_temperature(attempt: u32) -> f32 {
    if attempt <= 1 {
        0.0
    } else {
        (0.1 * (attempt - 1) as f32).min(0.5)
    }
}

/// Model-backed generator; every answer passes the SQL validator before it
/// is returned.
pub struct SqlGenerator {
    schemas: Arc<SchemaManager>,
    llm: Arc<LlmManager>,
    validator: SqlValidator,
    prompts: PromptBuilder,
    policy: RetryPolicy,
}

impl SqlGenerator {
    pub fn new(
        schemas: Arc<SchemaManager>,
        llm: Arc<LlmManager>,
        validator: SqlValidator,
        prompts: PromptBuilder,
        max_attempts: u32,
    ) -> Self {
        Self {
            schemas,
            llm,
            validator,
            prompts,
            policy: RetryPolicy::new(max_attempts, Backoff::None),
        }
    }
}

#[async_trait]
impl QueryGenerator for SqlGenerator {
    async fn generate(&self, natural_language: &str, database: &str) -> Result<GeneratedQuery, GenerationError> {
        let schema = self
            .schemas
            .get_schema(database)
            .await
            .ok_or_else(|| GenerationError::SchemaNotFound(database.to_string()))?;

        let system_prompt = self.prompts.system_prompt();
        let user_prompt = self.prompts.user_prompt(natural_language, &schema);

        let outcome = retry(
            self.policy,
            "sql_generation",
            |attempt, previous: Option<&AttemptError>| {
                let prompt = match previous {
                    Some(AttemptError::Rejected(errors)) => self.prompts.retry_prompt(&user_prompt, errors),
                    _ => user_prompt.clone(),
                };
                async move {
                    let output = self
                        .llm
                        .generate_sql(system_prompt, &prompt, Some(attempt_temperature(attempt)))
                        .await
                        .map_err(AttemptError::Ai)?;

                    let verdict = self.validator.validate(&output.sql);
                    if !verdict.valid {
                        let preview: String = output.sql.chars().take(100).collect();
                        warn!(database, attempt, errors = ?verdict.errors, sql = %preview, "Generated SQL rejected");
                        return Err(AttemptError::Rejected(verdict.errors));
                    }
                    Ok((attempt, output, verdict))
                }
            },
            AttemptError::is_retryable,
        )
        .await;

        match outcome {
            Ok((attempt, output, verdict)) => {
                info!(
                    database,
                    attempt,
                    warnings = verdict.warnings.len(),
                    "SQL generation succeeded"
                );
                Ok(GeneratedQuery {
                    sql: verdict.cleaned_sql.unwrap_or(output.sql),
                    validated: true,
                    warnings: verdict.warnings,
                    explanation: output.explanation,
                    assumptions: output.assumptions,
                    generation_method: if attempt > 1 {
                        GenerationMethod::RetryGenerated
                    } else {
                        GenerationMethod::AiGenerated
                    },
                    generated_at: Utc::now(),
                })
            }
            Err(AttemptError::Rejected(errors)) => Err(GenerationError::Exhausted {
                attempts: self.policy.max_attempts,
                last_error: errors.iter().take(3).cloned().collect::<Vec<_>>().join("; "),
            }),
            Err(AttemptError::Ai(e)) => {
                error!(database, error = %e, "AI service unavailable");
                Err(GenerationError::AiUnavailable(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema_manager::testing::{FakeInspector, manager_with};
    use crate::llm::testing::{ScriptedProvider, scripted_manager};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn generator(
        replies: Vec<Result<String, LlmError>>,
        max_attempts: u32,
    ) -> (SqlGenerator, Arc<ScriptedProvider>) {
        let schemas = manager_with(&[FakeInspector::new("shop", Duration::ZERO)]);
        schemas.initialize().await.unwrap();
        let (llm, provider) = scripted_manager(replies);
        let generator = SqlGenerator::new(
            schemas,
            Arc::new(llm),
            SqlValidator::default(),
            PromptBuilder::new(10),
            max_attempts,
        );
        (generator, provider)
    }

    fn reply(sql: &str) -> Result<String, LlmError> {
        Ok(serde_json::json!({"sql": sql, "explanation": "test", "assumptions": []}).to_string())
    }

    #[test]
    fn temperature_rises_with_attempts() {
        assert_eq!(attempt_temperature(1), 0.0);
        assert!((attempt_temperature(2) - 0.1).abs() < 1e-6);
        assert!((attempt_temperature(9) - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let (generator, provider) = generator(vec![reply("SELECT id, name FROM customers LIMIT 5")], 2).await;
        let query = generator.generate("list customers", "shop").await.unwrap();

        assert!(query.validated);
        assert_eq!(query.sql, "SELECT id, name FROM customers LIMIT 5");
        assert_eq!(query.generation_method, GenerationMethod::AiGenerated);
        assert!(query.warnings.is_empty());

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].temperature, 0.0);
        assert!(requests[0].user_prompt.contains("CREATE TABLE customers"));
    }

    #[tokio::test]
    async fn rejected_answer_is_retried_with_feedback() {
        let (generator, provider) = generator(
            vec![reply("DELETE FROM customers"), reply("SELECT * FROM customers")],
            2,
        )
        .await;
        let query = generator.generate("remove customers", "shop").await.unwrap();

        assert_eq!(query.generation_method, GenerationMethod::RetryGenerated);
        assert_eq!(query.sql, "SELECT * FROM customers");
        assert_eq!(query.warnings.len(), 2);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].temperature > 0.0);
        assert!(requests[1].user_prompt.contains("Previous SQL validation failed"));
        assert!(requests[1].user_prompt.contains("DELETE statements are not allowed"));
    }

    #[tokio::test]
    async fn exhausting_attempts_reports_last_error() {
        let (generator, provider) = generator(
            vec![reply("DROP TABLE customers"), reply("SELECT pg_sleep(10)")],
            2,
        )
        .await;
        let err = generator.generate("break it", "shop").await.unwrap_err();

        let GenerationError::Exhausted { attempts, last_error } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 2);
        assert!(last_error.contains("pg_sleep"));
        assert_eq!(provider.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_database_fails_before_calling_the_model() {
        let (generator, provider) = generator(vec![reply("SELECT 1")], 2).await;
        let err = generator.generate("anything", "warehouse").await.unwrap_err();
        assert_eq!(err, GenerationError::SchemaNotFound("warehouse".to_string()));
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_is_not_retried_as_validation() {
        let (generator, provider) = generator(
            vec![Err(LlmError::ConfigError("no key".into())), reply("SELECT 1")],
            3,
        )
        .await;
        let err = generator.generate("anything", "shop").await.unwrap_err();
        assert!(matches!(err, GenerationError::AiUnavailable(LlmError::ConfigError(_))));
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }
}
