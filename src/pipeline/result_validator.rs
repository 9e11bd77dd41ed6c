use crate::config::ResultValidationConfig;
use crate::db::models::QueryResult;
use crate::llm::LlmManager;
use crate::llm::prompts::relevance_prompt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How much checking a result gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Local checks only.
    Basic,
    /// Local checks plus a model relevance check.
    Semantic,
    /// Local checks, escalating to the model only when the result looks off.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    EmptyResult,
    TooFewRows,
    TooManyRows,
    ColumnMismatch,
    SemanticMismatch,
    SemanticUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSuggestion {
    pub issue: ValidationIssue,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_query: Option<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ValidationSuggestion {
    /// One-line form appended to a result's warnings.
    pub fn as_warning(&self) -> String {
        let mut line = format!("[{}] {}", self.severity, self.message);
        if let Some(query) = &self.suggested_query {
            line.push_str(&format!(" Suggested query: {}", query));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultVerdict {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub suggestions: Vec<ValidationSuggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f64>,
    pub level_used: ValidationLevel,
}

impl ResultVerdict {
    pub fn has_errors(&self) -> bool {
        self.suggestions.iter().any(|s| s.severity == Severity::Error)
    }
}

const STOPWORDS: &[&str] = &[
    "show", "list", "get", "all", "select", "from", "where", "the", "and", "or", "in", "on", "at",
    "to", "of", "for", "with", "what", "which", "how", "many", "are", "is", "each", "per", "by",
];

/// Words in the question that could plausibly name a result column.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == '?' || c == '!')
        .filter(|word| word.chars().count() > 2 && !stopwords.contains(word))
        .map(str::to_string)
        .collect()
}

/// Judges whether an executed result plausibly answers the question.
pub struct ResultValidator {
    llm: Option<Arc<LlmManager>>,
    min_expected_rows: usize,
    max_expected_rows: usize,
    semantic_threshold: f64,
    strict_semantic: bool,
}

impl ResultValidator {
    pub fn new(config: &ResultValidationConfig, llm: Option<Arc<LlmManager>>) -> Self {
        Self {
            llm,
            min_expected_rows: config.min_expected_rows,
            max_expected_rows: config.max_expected_rows,
            semantic_threshold: f64::from(config.semantic_threshold),
            strict_semantic: config.strict_semantic,
        }
    }

    pub async fn validate(&self, result: &QueryResult, natural_language: &str, level: ValidationLevel) -> ResultVerdict {
        info!(row_count = result.row_count, ?level, "Validating result");

        let mut verdict = self.basic_validation(result, natural_language);

        let Some(llm) = self.llm.as_ref().filter(|_| self.should_escalate(level, &verdict, result)) else {
            return verdict;
        };

        let prompt = relevance_prompt(natural_language, result.sql.as_deref().unwrap_or_default(), result);
        match llm.assess_relevance(&prompt).await {
            Ok(assessment) => {
                let score = assessment.match_score;
                if score < self.semantic_threshold {
                    verdict.issues.push(ValidationIssue::SemanticMismatch);
                    verdict.suggestions.push(ValidationSuggestion {
                        issue: ValidationIssue::SemanticMismatch,
                        severity: if score < 0.5 { Severity::Error } else { Severity::Warning },
                        message: format!(
                            "AI detected a low match between the result and the request (score: {:.2}).",
                            score
                        ),
                        suggested_query: assessment.suggestion,
                        confidence: 1.0 - score,
                        reasoning: Some(assessment.reason),
                    });
                }
                verdict.valid = verdict.valid && assessment.is_relevant;
                verdict.semantic_score = Some(score);
                verdict.level_used = ValidationLevel::Semantic;
                info!(is_relevant = assessment.is_relevant, match_score = score, "Semantic validation complete");
            }
            Err(e) if self.strict_semantic => {
                warn!(error = %e, "Semantic validation unavailable");
                verdict.valid = false;
                verdict.issues.push(ValidationIssue::SemanticUnavailable);
                verdict.suggestions.push(ValidationSuggestion {
                    issue: ValidationIssue::SemanticUnavailable,
                    severity: Severity::Error,
                    message: format!("Semantic validation could not be performed: {}", e),
                    suggested_query: None,
                    confidence: 1.0,
                    reasoning: None,
                });
            }
            Err(e) => {
                warn!(error = %e, "Semantic validation failed, keeping basic verdict");
            }
        }

        verdict
    }

    fn should_escalate(&self, level: ValidationLevel, basic: &ResultVerdict, result: &QueryResult) -> bool {
        match level {
            ValidationLevel::Basic => false,
            ValidationLevel::Semantic => true,
            ValidationLevel::Auto => {
                let escalate = result.row_count == 0
                    || result.row_count < self.min_expected_rows
                    || basic.issues.contains(&ValidationIssue::ColumnMismatch)
                    || !basic.valid
                    || basic.has_errors();
                debug!(escalate, "Automatic validation level decision");
                escalate
            }
        }
    }

    fn basic_validation(&self, result: &QueryResult, natural_language: &str) -> ResultVerdict {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();

        if result.row_count == 0 {
            issues.push(ValidationIssue::EmptyResult);
            suggestions.push(ValidationSuggestion {
                issue: ValidationIssue::EmptyResult,
                severity: Severity::Error,
                message: "The query returned no rows. The filters may be too strict, the data may not exist, \
                          or the table or column may be wrong."
                    .to_string(),
                suggested_query: None,
                confidence: 0.9,
                reasoning: None,
            });
        } else if result.row_count < self.min_expected_rows {
            issues.push(ValidationIssue::TooFewRows);
            suggestions.push(ValidationSuggestion {
                issue: ValidationIssue::TooFewRows,
                severity: Severity::Warning,
                message: format!(
                    "Only {} rows returned. Consider relaxing the filters or checking the data is complete.",
                    result.row_count
                ),
                suggested_query: None,
                confidence: 0.6,
                reasoning: None,
            });
        }

        if result.row_count >= self.max_expected_rows || result.truncated {
            issues.push(ValidationIssue::TooManyRows);
            let note = if result.truncated { " (result truncated)" } else { "" };
            suggestions.push(ValidationSuggestion {
                issue: ValidationIssue::TooManyRows,
                severity: Severity::Warning,
                message: format!(
                    "Large result ({} rows){}. Add more specific filters or a smaller LIMIT.",
                    result.row_count, note
                ),
                suggested_query: None,
                confidence: 0.7,
                reasoning: None,
            });
        }

        if result.row_count > 0 {
            let keywords = extract_keywords(natural_language);
            let columns: Vec<String> = result.columns.iter().map(|c| c.name.to_lowercase()).collect();
            if !keywords.is_empty() && !keywords.iter().any(|k| columns.contains(k)) {
                issues.push(ValidationIssue::ColumnMismatch);
                suggestions.push(ValidationSuggestion {
                    issue: ValidationIssue::ColumnMismatch,
                    severity: Severity::Info,
                    message: format!(
                        "Query keywords ({}) do not appear in the result columns ({}). \
                         The wrong table or columns may have been used.",
                        keywords.join(", "),
                        columns.join(", ")
                    ),
                    suggested_query: None,
                    confidence: 0.5,
                    reasoning: None,
                });
            }
        }

        ResultVerdict {
            valid: !issues.contains(&ValidationIssue::EmptyResult),
            issues,
            suggestions,
            semantic_score: None,
            level_used: ValidationLevel::Basic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ColumnDescriptor;
    use crate::llm::LlmError;
    use crate::llm::testing::scripted_manager;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use std::time::Duration;

    fn config() -> ResultValidationConfig {
        ResultValidationConfig {
            min_expected_rows: 1,
            max_expected_rows: 100,
            semantic_threshold: 0.7,
            strict_semantic: false,
        }
    }

    fn result(columns: &[&str], rows: usize, limit: usize) -> QueryResult {
        let descriptors = columns
            .iter()
            .map(|name| ColumnDescriptor { name: name.to_string(), data_type: "text".into() })
            .collect();
        let rows = (0..rows)
            .map(|i| {
                let mut map = Map::new();
                for column in columns {
                    map.insert(column.to_string(), json!(format!("{column}-{i}")));
                }
                map
            })
            .collect();
        let mut result = QueryResult::from_rows(descriptors, rows, limit, Duration::from_millis(1));
        result.sql = Some("SELECT name, email FROM customers".to_string());
        result
    }

    #[test]
    fn keywords_drop_stopwords_and_short_words() {
        assert_eq!(
            extract_keywords("Show all the customers, by email."),
            vec!["customers".to_string(), "email".to_string()]
        );
    }

    #[tokio::test]
    async fn healthy_result_passes_basic_checks() {
        let validator = ResultValidator::new(&config(), None);
        let verdict = validator
            .validate(&result(&["name", "email"], 10, 50), "customer name and email", ValidationLevel::Auto)
            .await;
        assert!(verdict.valid);
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.level_used, ValidationLevel::Basic);
    }

    #[tokio::test]
    async fn empty_result_is_invalid() {
        let validator = ResultValidator::new(&config(), None);
        let verdict = validator
            .validate(&result(&["name"], 0, 50), "customers in mars", ValidationLevel::Basic)
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.issues, vec![ValidationIssue::EmptyResult]);
        assert!(verdict.has_errors());
    }

    #[tokio::test]
    async fn truncated_and_mismatched_results_are_flagged() {
        let validator = ResultValidator::new(&config(), None);
        let verdict = validator
            .validate(&result(&["id"], 20, 10), "product prices", ValidationLevel::Basic)
            .await;
        assert!(verdict.valid);
        assert_eq!(
            verdict.issues,
            vec![ValidationIssue::TooManyRows, ValidationIssue::ColumnMismatch]
        );
        assert!(verdict.suggestions[0].as_warning().starts_with("[warning] Large result (10 rows) (result truncated)"));
    }

    #[tokio::test]
    async fn auto_skips_model_when_result_looks_fine() {
        let (llm, provider) = scripted_manager(vec![]);
        let validator = ResultValidator::new(&config(), Some(Arc::new(llm)));
        validator
            .validate(&result(&["email"], 5, 50), "customer email", ValidationLevel::Auto)
            .await;
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_escalates_on_empty_result() {
        let (llm, provider) = scripted_manager(vec![Ok(
            r#"{"is_relevant": false, "match_score": 0.2, "reason": "wrong table", "suggestion": "SELECT * FROM orders"}"#
                .to_string(),
        )]);
        let validator = ResultValidator::new(&config(), Some(Arc::new(llm)));
        let verdict = validator
            .validate(&result(&["name"], 0, 50), "orders today", ValidationLevel::Auto)
            .await;

        assert_eq!(provider.requests.lock().unwrap().len(), 1);
        assert_eq!(verdict.level_used, ValidationLevel::Semantic);
        assert_eq!(verdict.semantic_score, Some(0.2));
        assert!(verdict.issues.contains(&ValidationIssue::SemanticMismatch));
        let semantic = verdict.suggestions.last().unwrap();
        assert_eq!(semantic.severity, Severity::Error);
        assert_eq!(semantic.suggested_query.as_deref(), Some("SELECT * FROM orders"));
    }

    #[tokio::test]
    async fn model_failure_keeps_basic_verdict() {
        let (llm, _) = scripted_manager(vec![Err(LlmError::ResponseError("boom".into()))]);
        let validator = ResultValidator::new(&config(), Some(Arc::new(llm)));
        let verdict = validator
            .validate(&result(&["email"], 5, 50), "customer email", ValidationLevel::Semantic)
            .await;
        assert!(verdict.valid);
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.level_used, ValidationLevel::Basic);
    }

    #[tokio::test]
    async fn strict_mode_reports_unavailable_model() {
        let (llm, _) = scripted_manager(vec![Err(LlmError::ResponseError("boom".into()))]);
        let strict = ResultValidationConfig { strict_semantic: true, ..config() };
        let validator = ResultValidator::new(&strict, Some(Arc::new(llm)));
        let verdict = validator
            .validate(&result(&["email"], 5, 50), "customer email", ValidationLevel::Semantic)
            .await;
        assert!(!verdict.valid);
        assert_eq!(verdict.issues, vec![ValidationIssue::SemanticUnavailable]);
    }
}
