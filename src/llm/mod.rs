pub mod models;
pub mod prompts;
pub mod providers;
pub mod response;

use crate::config::LlmConfig;
use crate::llm::models::{RelevanceAssessment, SqlGenerationOutput};
use crate::util::retry::{Backoff, RetryPolicy, retry};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),

    #[error("LLM response error: {0}")]
    ResponseError(String),

    #[error("LLM configuration error: {0}")]
    ConfigError(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("LLM server error (status {status}): {detail}")]
    ServerError { status: u16, detail: String },
}

impl LlmError {
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "AI_CONNECTION_FAILED",
            Self::ResponseError(_) => "AI_BAD_RESPONSE",
            Self::ConfigError(_) => "AI_CONFIG_ERROR",
            Self::Timeout(_) => "AI_TIMEOUT",
            Self::RateLimited(_) => "AI_RATE_LIMITED",
            Self::ServerError { .. } => "AI_SERVER_ERROR",
        }
    }

    /// Transient failures worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::ServerError { .. }
        )
    }
}

/// One chat-style completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend to constrain output to a JSON object.
    pub json_mode: bool,
}

/// A language-model backend that turns prompts into text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;

    fn name(&self) -> &str;
}

/// Timeout and retry policy around a provider, plus response parsing.
pub struct LlmManager {
    provider: Box<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    retry_policy: RetryPolicy,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider: Box<dyn LlmProvider> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        Ok(Self::with_provider(provider, config))
    }

    pub fn with_provider(provider: Box<dyn LlmProvider>, config: &LlmConfig) -> Self {
        info!(provider = provider.name(), model = %config.model, "LLM provider ready");
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            retry_policy: RetryPolicy::new(
                config.max_retries.saturating_add(1),
                Backoff::Exponential {
                    base: Duration::from_millis(500),
                    max: Duration::from_secs(8),
                },
            ),
        }
    }

    async fn complete_with_retry(&self, request: ChatRequest) -> Result<String, LlmError> {
        let timeout = self.timeout;
        retry(
            self.retry_policy,
            "llm_completion",
            |attempt, _: Option<&LlmError>| {
                let request = &request;
                async move {
                    debug!(provider = self.provider.name(), attempt, "Sending completion request");
                    match tokio::time::timeout(timeout, self.provider.complete(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(LlmError::Timeout(timeout.as_secs())),
                    }
                }
            },
            LlmError::is_retryable,
        )
        .await
    }

    /// Asks the model for a single SQL statement. `temperature` overrides the
    /// configured default.
    pub async fn generate_sql(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: Option<f32>,
    ) -> Result<SqlGenerationOutput, LlmError> {
        let request = ChatRequest {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            temperature: temperature.unwrap_or(self.temperature),
            max_tokens: self.max_tokens,
            json_mode: true,
        };

        let content = self.complete_with_retry(request).await?;
        response::parse_generation(&content)
    }

    /// Asks the model whether a result answers the question. Malformed
    /// assessments are read permissively; only transport failures are errors.
    pub async fn assess_relevance(&self, prompt: &str) -> Result<RelevanceAssessment, LlmError> {
        let request = ChatRequest {
            system_prompt: prompts::RELEVANCE_SYSTEM_PROMPT.to_string(),
            user_prompt: prompt.to_string(),
            temperature: 0.3,
            max_tokens: 500,
            json_mode: true,
        };

        let content = self.complete_with_retry(request).await?;
        Ok(response::parse_relevance(&content))
    }
}
