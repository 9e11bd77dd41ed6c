use serde::{Deserialize, Serialize};

/// What the model returned for a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGenerationOutput {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

/// The model's judgement of whether a result answers the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceAssessment {
    pub is_relevant: bool,
    pub match_score: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Default for RelevanceAssessment {
    fn default() -> Self {
        Self {
            is_relevant: true,
            match_score: 1.0,
            reason: String::new(),
            suggestion: None,
            issues: Vec::new(),
        }
    }
}
