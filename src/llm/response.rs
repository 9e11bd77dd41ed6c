use crate::llm::LlmError;
use crate::llm::models::{RelevanceAssessment, SqlGenerationOutput};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::warn;

static SQL_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```sql\s*(.*?)```").expect("valid regex"));
static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)```").expect("valid regex"));
static QUERY_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(select|with)\b").expect("valid regex"));
static BARE_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\b(select|with)\b.*?(;|$)").expect("valid regex"));

/// Reads a generation reply.
///
/// A JSON object must carry a non-empty string `sql`. Text that is not JSON
/// at all falls back to pulling a statement out of fences or prose; JSON
/// without usable `sql` is an error rather than a candidate for extraction.
pub fn parse_generation(content: &str) -> Result<SqlGenerationOutput, LlmError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(LlmError::ResponseError("model returned an empty response".to_string()));
    }

    match serde_json::from_str::<Value>(content) {
        Ok(data) => {
            let sql = data
                .get("sql")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    LlmError::ResponseError("model returned JSON without a valid sql string".to_string())
                })?;

            Ok(SqlGenerationOutput {
                sql: sql.to_string(),
                explanation: data
                    .get("explanation")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                assumptions: string_list(data.get("assumptions")),
            })
        }
        Err(parse_error) => {
            let preview: String = content.chars().take(200).collect();
            warn!(error = %parse_error, content = %preview, "Model reply is not JSON, extracting SQL from text");

            extract_sql(content)
                .map(|sql| SqlGenerationOutput {
                    sql,
                    explanation: Some("Generated from non-JSON response.".to_string()),
                    assumptions: Vec::new(),
                })
                .ok_or_else(|| {
                    LlmError::ResponseError(format!("failed to parse model response: {}", parse_error))
                })
        }
    }
}

/// Pulls a query out of free text: a ```sql fence, then any fence holding a
/// SELECT or WITH, then the first bare statement.
pub fn extract_sql(content: &str) -> Option<String> {
    if let Some(sql) = SQL_FENCE
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(sql);
    }

    if let Some(sql) = ANY_FENCE
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty() && QUERY_KEYWORD.is_match(s))
    {
        return Some(sql);
    }

    BARE_STATEMENT
        .find(content)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Reads a relevance reply. Anything unparseable counts as relevant so a
/// flaky judgement never blocks a result.
pub fn parse_relevance(content: &str) -> RelevanceAssessment {
    let data: Value = match serde_json::from_str(content.trim()) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Relevance reply is not JSON, assuming relevant");
            return RelevanceAssessment {
                reason: format!("Failed to parse AI response: {}", e),
                ..RelevanceAssessment::default()
            };
        }
    };

    let is_relevant = data.get("is_relevant").and_then(Value::as_bool);
    let match_score = data.get("match_score").and_then(score_value);
    let (Some(is_relevant), Some(match_score)) = (is_relevant, match_score) else {
        warn!("Relevance reply is missing fields, assuming relevant");
        return RelevanceAssessment {
            reason: "AI response format invalid, assuming valid".to_string(),
            ..RelevanceAssessment::default()
        };
    };

    RelevanceAssessment {
        is_relevant,
        match_score: match_score.clamp(0.0, 1.0),
        reason: data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("No reason provided")
            .to_string(),
        suggestion: data
            .get("suggestion")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        issues: string_list(data.get("issues")),
    }
}

fn score_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_json_reply() {
        let output = parse_generation(
            r#"{"sql": " SELECT id FROM users LIMIT 10 ", "explanation": "all users", "assumptions": ["active only", 3]}"#,
        )
        .unwrap();
        assert_eq!(output.sql, "SELECT id FROM users LIMIT 10");
        assert_eq!(output.explanation.as_deref(), Some("all users"));
        assert_eq!(output.assumptions, vec!["active only".to_string()]);
    }

    #[test]
    fn json_without_sql_string_is_an_error() {
        for reply in [
            r#"{"explanation": "no idea"}"#,
            r#"{"sql": {"select": "id"}}"#,
            r#"{"sql": "   "}"#,
            r#"{"sql": null, "explanation": "SELECT 1"}"#,
        ] {
            assert!(
                matches!(parse_generation(reply), Err(LlmError::ResponseError(_))),
                "{reply}"
            );
        }
    }

    #[test]
    fn falls_back_to_fenced_sql() {
        let reply = "Here you go:\n```sql\nSELECT name FROM customers;\n```\nEnjoy.";
        let output = parse_generation(reply).unwrap();
        assert_eq!(output.sql, "SELECT name FROM customers;");
        assert_eq!(output.explanation.as_deref(), Some("Generated from non-JSON response."));
    }

    #[test]
    fn extraction_order() {
        assert_eq!(
            extract_sql("```\nwith t as (select 1) select * from t\n```").as_deref(),
            Some("with t as (select 1) select * from t")
        );
        // A fence without a query is skipped in favour of prose.
        assert_eq!(
            extract_sql("```\nnot a query\n``` then SELECT 2; trailing").as_deref(),
            Some("SELECT 2;")
        );
        assert_eq!(extract_sql("Answer: select count(*) from orders").as_deref(), Some("select count(*) from orders"));
        assert_eq!(extract_sql("I cannot help with that."), None);
    }

    #[test]
    fn unparseable_text_without_sql_is_an_error() {
        assert!(parse_generation("sorry, no").is_err());
        assert!(parse_generation("   ").is_err());
    }

    #[test]
    fn relevance_reply_is_read() {
        let assessment = parse_relevance(
            r#"{"is_relevant": false, "match_score": 0.3, "reason": "wrong table", "suggestion": "SELECT * FROM users", "issues": ["products returned"]}"#,
        );
        assert!(!assessment.is_relevant);
        assert_eq!(assessment.match_score, 0.3);
        assert_eq!(assessment.reason, "wrong table");
        assert_eq!(assessment.suggestion.as_deref(), Some("SELECT * FROM users"));
        assert_eq!(assessment.issues, vec!["products returned".to_string()]);
    }

    #[test]
    fn malformed_relevance_is_permissive() {
        let missing = parse_relevance(r#"{"reason": "hmm"}"#);
        assert!(missing.is_relevant);
        assert_eq!(missing.match_score, 1.0);

        let garbage = parse_relevance("definitely relevant!");
        assert!(garbage.is_relevant);
        assert_eq!(garbage.match_score, 1.0);
        assert!(garbage.reason.starts_with("Failed to parse AI response"));
    }

    #[test]
    fn relevance_score_is_clamped_and_accepts_strings() {
        assert_eq!(parse_relevance(r#"{"is_relevant": true, "match_score": 1.7}"#).match_score, 1.0);
        assert_eq!(parse_relevance(r#"{"is_relevant": true, "match_score": "0.8"}"#).match_score, 0.8);
    }
}
