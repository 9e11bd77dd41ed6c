use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Name and PostgreSQL type name of a result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

/// Rows returned to the caller. `row_count` always equals `rows.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl QueryResult {
    /// Keeps at most `limit` rows and marks the result truncated when more arrived.
    pub fn from_rows(
        columns: Vec<ColumnDescriptor>,
        mut rows: Vec<Map<String, Value>>,
        limit: usize,
        elapsed: Duration,
    ) -> Self {
        let truncated = rows.len() > limit;
        rows.truncate(limit);

        Self {
            sql: None,
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            execution_time_ms: elapsed.as_secs_f64() * 1000.0,
            warnings: Vec::new(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(id));
        map
    }

    #[test]
    fn truncates_to_limit_and_flags_it() {
        let columns = vec![ColumnDescriptor { name: "id".into(), data_type: "int8".into() }];
        let rows = (0..5).map(row).collect();
        let result = QueryResult::from_rows(columns, rows, 3, Duration::from_millis(12));

        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);
        assert!(result.execution_time_ms >= 12.0);
    }

    #[test]
    fn exact_fit_is_not_truncated() {
        let rows = (0..3).map(row).collect();
        let result = QueryResult::from_rows(Vec::new(), rows, 3, Duration::ZERO);
        assert!(!result.truncated);
        assert_eq!(result.row_count, 3);
    }
}
