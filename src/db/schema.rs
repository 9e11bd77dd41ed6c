use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub index_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySchema {
    pub name: String,
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count_estimate: Option<i64>,
}

impl TableSchema {
    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Immutable point-in-time description of one database.
///
/// Snapshots are replaced whole on refresh and never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub database: String,
    pub tables: BTreeMap<String, TableSchema>,
    #[serde(default)]
    pub views: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(database: impl Into<String>, tables: Vec<TableSchema>, views: Vec<String>) -> Self {
        Self {
            database: database.into(),
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            views,
            captured_at: Utc::now(),
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Renders `CREATE TABLE` text for the named tables, or all tables when
    /// `only` is `None`. Unknown names are skipped.
    pub fn to_ddl(&self, only: Option<&[String]>) -> String {
        let selected: Vec<&TableSchema> = match only {
            Some(names) => names.iter().filter_map(|n| self.tables.get(n)).collect(),
            None => self.tables.values().collect(),
        };

        selected
            .into_iter()
            .map(table_ddl)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn table_ddl(table: &TableSchema) -> String {
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut line = format!("  {} {}", column.name, column.data_type);
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if column.primary_key {
                line.push_str(" PRIMARY KEY");
            }
            line
        })
        .collect();

    for fk in &table.foreign_keys {
        lines.push(format!(
            "  FOREIGN KEY ({}) REFERENCES {}({})",
            fk.column, fk.foreign_table, fk.foreign_column
        ));
    }

    format!("CREATE TABLE {} (\n{}\n);", table.name, lines.join(",\n"))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn column(name: &str, data_type: &str, primary_key: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: !primary_key,
            primary_key,
            default_value: None,
        }
    }

    pub fn shop_snapshot() -> SchemaSnapshot {
        let customers = TableSchema {
            name: "customers".to_string(),
            columns: vec![
                column("id", "integer", true),
                column("name", "text", false),
                column("email", "text", false),
            ],
            indexes: vec![IndexSchema {
                name: "customers_email_key".to_string(),
                columns: vec!["email".to_string()],
                unique: true,
                index_type: "btree".to_string(),
            }],
            foreign_keys: Vec::new(),
            row_count_estimate: Some(1200),
        };
        let orders = TableSchema {
            name: "orders".to_string(),
            columns: vec![
                column("id", "integer", true),
                column("customer_id", "integer", false),
                column("total_amount", "numeric", false),
                column("created_at", "timestamp with time zone", false),
            ],
            indexes: Vec::new(),
            foreign_keys: vec![ForeignKeySchema {
                name: "orders_customer_id_fkey".to_string(),
                column: "customer_id".to_string(),
                foreign_table: "customers".to_string(),
                foreign_column: "id".to_string(),
            }],
            row_count_estimate: None,
        };
        let order_items = TableSchema {
            name: "order_items".to_string(),
            columns: vec![
                column("order_id", "integer", false),
                column("product_name", "text", false),
                column("quantity", "integer", false),
            ],
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            row_count_estimate: None,
        };
        SchemaSnapshot::new("shop", vec![customers, orders, order_items], vec!["recent_orders".to_string()])
    }
}
