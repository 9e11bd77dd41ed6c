use crate::pipeline::generator::GenerationMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Coarse outcome of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    ValidationFailed,
    ExecutionFailed,
    AiFailed,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuditStatus::Success => "success",
            AuditStatus::ValidationFailed => "validation_failed",
            AuditStatus::ExecutionFailed => "execution_failed",
            AuditStatus::AiFailed => "ai_failed",
        };
        f.write_str(text)
    }
}

/// One line of the query history. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub database: String,
    pub natural_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_method: Option<GenerationMethod>,
}

impl AuditEntry {
    pub fn new(request_id: Uuid, database: &str, natural_language: &str, status: AuditStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            database: database.to_string(),
            natural_language: natural_language.to_string(),
            sql: None,
            status,
            execution_time_ms: None,
            row_count: None,
            error_message: None,
            generation_method: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn absent_fields_are_omitted() {
        let entry = AuditEntry::new(Uuid::new_v4(), "shop", "count orders", AuditStatus::AiFailed);
        let json: Value = serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();

        let object = json.as_object().unwrap();
        assert_eq!(object["status"], "ai_failed");
        assert!(!object.contains_key("sql"));
        assert!(!object.contains_key("row_count"));
        assert!(object["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn generation_method_uses_snake_case() {
        let mut entry = AuditEntry::new(Uuid::new_v4(), "shop", "q", AuditStatus::Success);
        entry.generation_method = Some(GenerationMethod::RetryGenerated);
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains(r#""generation_method":"retry_generated""#));
    }
}
