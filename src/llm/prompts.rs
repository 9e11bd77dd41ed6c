use crate::db::models::QueryResult;
use crate::db::schema::SchemaSnapshot;

pub const SYSTEM_PROMPT: &str = r#"You are an expert PostgreSQL query writer.

Responsibilities:
1. Turn the user's natural-language request into one accurate PostgreSQL SELECT query
2. Only ever produce read-only queries; never produce statements that modify data
3. Use the provided database schema so every table and column name is correct
4. Follow PostgreSQL best practices

Constraints:
- Only SELECT statements. No INSERT, UPDATE, DELETE or DDL
- Every table and column must exist in the provided schema
- Name columns explicitly instead of SELECT * unless the user asks for everything
- Add a sensible LIMIT (default 1000) to avoid huge results
- Use parentheses to make precedence explicit in complex conditions

Output format:
Return strict JSON:
{
  "sql": "a single SELECT statement as a string",
  "explanation": "short explanation (string)",
  "assumptions": ["assumptions you made (array of strings)"]
}

Important:
- The sql field must be a string, never a nested object or array
- Do not output Markdown, code fences or any other text

When things are unclear:
- If you cannot understand the request, say why in explanation
- If a requested table or column does not exist, point the user to the correct name
"#;

pub const RELEVANCE_SYSTEM_PROMPT: &str = "You are a database query result validator. \
Evaluate if SQL query results semantically match the user's intent. \
Respond ONLY with valid JSON.";

const SAMPLE_ROWS: usize = 5;
const SAMPLE_CHARS: usize = 1000;
const RETRY_ERRORS: usize = 3;

/// Builds generation prompts from a schema snapshot, keeping the schema
/// section to the tables most likely involved in the question.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_tables: usize,
}

impl PromptBuilder {
    pub fn new(max_tables: usize) -> Self {
        Self {
            max_tables: max_tables.max(1),
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    pub fn user_prompt(&self, natural_language: &str, schema: &SchemaSnapshot) -> String {
        let tables = self.select_relevant_tables(natural_language, schema);
        let ddl = schema.to_ddl(Some(&tables));

        format!(
            "# Database Schema\n{ddl}\n\n# User Query\n\n\
             Generate PostgreSQL SELECT query for the following natural language:\n\n\
             \"{natural_language}\"\n\n\
             Generate accurate SQL, brief explanation, and any assumptions."
        )
    }

    /// Appends the previous attempt's validation failures to the prompt.
    pub fn retry_prompt(&self, original: &str, errors: &[String]) -> String {
        let summary = errors
            .iter()
            .take(RETRY_ERRORS)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");

        format!(
            "{original}\n\n**IMPORTANT**: Previous SQL validation failed:\n{summary}\n\n\
             Please regenerate ensuring ONLY SELECT statement with no modification operations."
        )
    }

    /// Ranks tables by how strongly the question mentions them or their
    /// columns. Falls back to the first tables when nothing matches.
    pub fn select_relevant_tables(&self, natural_language: &str, schema: &SchemaSnapshot) -> Vec<String> {
        let question = natural_language.to_lowercase();

        let mut scored: Vec<(u32, &str)> = schema
            .tables
            .values()
            .map(|table| {
                let name = table.name.to_lowercase();
                let mut score = 0;
                if question.contains(&name) {
                    score += 10;
                }
                if name.contains('_') && question.contains(&name.replace('_', " ")) {
                    score += 8;
                }
                score += 2 * name
                    .split('_')
                    .filter(|word| !word.is_empty() && question.contains(word))
                    .count() as u32;
                score += 3 * table
                    .columns
                    .iter()
                    .filter(|c| question.contains(&c.name.to_lowercase()))
                    .count() as u32;
                (score, table.name.as_str())
            })
            .collect();

        // Stable sort keeps name order among ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let relevant: Vec<String> = scored
            .iter()
            .take(self.max_tables)
            .filter(|(score, _)| *score > 0)
            .map(|(_, name)| name.to_string())
            .collect();

        if relevant.is_empty() {
            schema.tables.keys().take(self.max_tables).cloned().collect()
        } else {
            relevant
        }
    }
}

/// Prompt asking the model to judge a result against the question.
pub fn relevance_prompt(natural_language: &str, sql: &str, result: &QueryResult) -> String {
    let samples: Vec<_> = result.rows.iter().take(SAMPLE_ROWS).collect();
    let mut sample_text = if samples.is_empty() {
        "No data returned".to_string()
    } else {
        serde_json::to_string_pretty(&samples).unwrap_or_else(|_| "[]".to_string())
    };
    if sample_text.chars().count() > SAMPLE_CHARS {
        sample_text = sample_text.chars().take(SAMPLE_CHARS).collect();
        sample_text.push_str("\n... (truncated)");
    }

    let columns = if result.columns.is_empty() {
        "No columns".to_string()
    } else {
        result.column_names().join(", ")
    };

    format!(
        r#"Evaluate if the SQL query result semantically matches the user's intent.

**User Request**: "{natural_language}"

**SQL Executed**:
```sql
{sql}
```

**Result Columns**: {columns}

**Sample Data** (first {count} rows):
```json
{sample_text}
```

**Your Task**:
1. Does the result semantically answer the user's question?
2. Are the returned columns relevant to the request?
3. Does the sample data look correct based on the query intent?

**Evaluation Criteria**:
- **High match (0.9-1.0)**: Perfect semantic match, answers the question directly
- **Good match (0.7-0.8)**: Mostly relevant, minor column naming differences
- **Partial match (0.5-0.6)**: Some relevance, but may be missing key info
- **Poor match (0.0-0.4)**: Wrong table, wrong columns, or completely irrelevant

**Output Format** (MUST be valid JSON):
{{
    "is_relevant": true/false,
    "match_score": 0.0-1.0,
    "reason": "Brief explanation of the score",
    "suggestion": "Improved SQL query (if match_score < 0.7, otherwise null)",
    "issues": ["List of specific issues detected, if any"]
}}

**Important**:
- If user asked for "users" but got "products", match_score should be very low
- If column names differ slightly (e.g., "user_name" vs "username"), still acceptable
- Empty result should be flagged with low match_score if data is expected
- Respond ONLY with valid JSON, no markdown formatting
"#,
        count = samples.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ColumnDescriptor;
    use crate::db::schema::fixtures::shop_snapshot;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn ranks_tables_mentioned_in_the_question() {
        let prompts = PromptBuilder::new(2);
        let tables = prompts.select_relevant_tables("total quantity of each product in order items", &shop_snapshot());
        // "order" alone does not match the orders table.
        assert_eq!(tables, vec!["order_items".to_string()]);
    }

    #[test]
    fn limits_and_orders_by_score() {
        let prompts = PromptBuilder::new(2);
        let tables = prompts.select_relevant_tables("customers with orders and their email", &shop_snapshot());
        assert_eq!(tables, vec!["customers".to_string(), "orders".to_string()]);
    }

    #[test]
    fn falls_back_to_first_tables_when_nothing_matches() {
        let prompts = PromptBuilder::new(2);
        let tables = prompts.select_relevant_tables("how is the weather", &shop_snapshot());
        assert_eq!(tables, vec!["customers".to_string(), "order_items".to_string()]);
    }

    #[test]
    fn user_prompt_embeds_schema_and_question() {
        let prompt = PromptBuilder::new(10).user_prompt("list customers", &shop_snapshot());
        assert!(prompt.starts_with("# Database Schema\nCREATE TABLE customers ("));
        assert!(!prompt.contains("CREATE TABLE orders"));
        assert!(prompt.contains("\"list customers\""));
    }

    #[test]
    fn retry_prompt_keeps_first_three_errors() {
        let errors: Vec<String> = (1..=5).map(|i| format!("e{i}")).collect();
        let prompt = PromptBuilder::new(10).retry_prompt("base", &errors);
        assert!(prompt.starts_with("base\n\n**IMPORTANT**: Previous SQL validation failed:\ne1; e2; e3\n"));
        assert!(!prompt.contains("e4"));
    }

    #[test]
    fn relevance_prompt_truncates_samples() {
        let rows = (0..20)
            .map(|i| {
                json!({"id": i, "note": "x".repeat(100)})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect();
        let columns = vec![
            ColumnDescriptor { name: "id".into(), data_type: "int4".into() },
            ColumnDescriptor { name: "note".into(), data_type: "text".into() },
        ];
        let result = QueryResult::from_rows(columns, rows, 100, Duration::from_millis(3));

        let prompt = relevance_prompt("notes", "SELECT id, note FROM notes", &result);
        assert!(prompt.contains("**Result Columns**: id, note"));
        assert!(prompt.contains("(first 5 rows)"));
        assert!(prompt.contains("... (truncated)"));
    }

    #[test]
    fn relevance_prompt_handles_empty_results() {
        let result = QueryResult::from_rows(Vec::new(), Vec::new(), 10, Duration::ZERO);
        let prompt = relevance_prompt("anything", "SELECT 1 WHERE false", &result);
        assert!(prompt.contains("No data returned"));
        assert!(prompt.contains("No columns"));
    }
}
