use serde::Serialize;
use sqlparser::ast::{
    Expr, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use tracing::debug;

/// Server-side functions that read files, run commands, sleep or reach other servers.
const DANGEROUS_FUNCTIONS: &[&str] = &[
    // filesystem
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_ls_logdir",
    "pg_ls_waldir",
    "pg_ls_tmpdir",
    // large objects
    "lo_import",
    "lo_export",
    "lo_get",
    "lo_put",
    "lo_from_bytea",
    // process control and configuration
    "pg_execute",
    "pg_sleep",
    "pg_sleep_for",
    "pg_sleep_until",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "set_config",
    "pg_advisory_lock",
    "pg_advisory_xact_lock",
    // remote access
    "dblink",
    "dblink_exec",
    "dblink_connect",
    "dblink_send_query",
];

const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema"];

/// Coarse class of a parsed statement, decided by an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    Query,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Truncate,
    Copy,
    Privilege,
    Command,
}

impl StatementKind {
    pub fn of(statement: &Statement) -> Self {
        match statement {
            Statement::Query(_) => StatementKind::Query,
            Statement::Insert { .. } => StatementKind::Insert,
            Statement::Update { .. } => StatementKind::Update,
            Statement::Delete { .. } => StatementKind::Delete,
            Statement::Merge { .. } => StatementKind::Merge,
            Statement::CreateTable { .. }
            | Statement::CreateView { .. }
            | Statement::CreateIndex { .. }
            | Statement::CreateSchema { .. }
            | Statement::CreateDatabase { .. }
            | Statement::CreateFunction { .. }
            | Statement::CreateRole { .. }
            | Statement::CreateSequence { .. }
            | Statement::CreateType { .. } => StatementKind::Create,
            Statement::AlterTable { .. }
            | Statement::AlterIndex { .. }
            | Statement::AlterView { .. }
            | Statement::AlterRole { .. } => StatementKind::Alter,
            Statement::Drop { .. } | Statement::DropFunction { .. } => StatementKind::Drop,
            Statement::Truncate { .. } => StatementKind::Truncate,
            Statement::Copy { .. } => StatementKind::Copy,
            Statement::Grant { .. } | Statement::Revoke { .. } => StatementKind::Privilege,
            // Anything the gateway does not recognize is treated as a command and refused.
            _ => StatementKind::Command,
        }
    }

    pub fn is_read_only(self) -> bool {
        match self {
            StatementKind::Query => true,
            StatementKind::Insert
            | StatementKind::Update
            | StatementKind::Delete
            | StatementKind::Merge
            | StatementKind::Create
            | StatementKind::Alter
            | StatementKind::Drop
            | StatementKind::Truncate
            | StatementKind::Copy
            | StatementKind::Privilege
            | StatementKind::Command => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatementKind::Query => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Merge => "MERGE",
            StatementKind::Create => "CREATE",
            StatementKind::Alter => "ALTER",
            StatementKind::Drop => "DROP",
            StatementKind::Truncate => "TRUNCATE",
            StatementKind::Copy => "COPY",
            StatementKind::Privilege => "GRANT/REVOKE",
            StatementKind::Command => "Administrative",
        }
    }
}

/// Outcome of validating one candidate SQL text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Comment-free text of the accepted statement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned_sql: Option<String>,
}

impl SqlVerdict {
    fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
            cleaned_sql: None,
        }
    }

    fn rejected_all(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            warnings: Vec::new(),
            cleaned_sql: None,
        }
    }
}

/// Stateless read-only SQL gate for PostgreSQL text.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    block_system_catalogs: bool,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SqlValidator {
    pub fn new(block_system_catalogs: bool) -> Self {
        Self {
            block_system_catalogs,
        }
    }

    /// Checks `sql` stage by stage and stops at the first failing stage.
    /// Warnings are only produced for accepted statements.
    pub fn validate(&self, sql: &str) -> SqlVerdict {
        if sql.trim().is_empty() {
            return SqlVerdict::rejected("SQL query cannot be empty");
        }

        let cleaned = strip_comments(sql);
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == ';' || c.is_whitespace()) {
            return SqlVerdict::rejected("No valid SQL statements found");
        }

        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, cleaned) {
            Ok(statements) => statements,
            Err(e) => return SqlVerdict::rejected(format!("SQL syntax error: {}", e)),
        };

        let statement = match statements.as_slice() {
            [] => return SqlVerdict::rejected("No valid SQL statements found"),
            [statement] => statement,
            _ => {
                return SqlVerdict::rejected(
                    "multiple statements not allowed (potential SQL injection)",
                );
            }
        };

        let query = match statement {
            Statement::Query(query) => query,
            other => return SqlVerdict::rejected(forbidden_message(other)),
        };

        if let Some(kind) = unsupported_body(&query.body) {
            return SqlVerdict::rejected(format!(
                "Statement type '{}' is not allowed (only SELECT queries permitted)",
                kind
            ));
        }

        let mut findings = SafetyVisitor::default();
        let _ = statement.visit(&mut findings);

        if !findings.forbidden.is_empty() {
            return SqlVerdict::rejected_all(findings.forbidden);
        }
        if !findings.functions.is_empty() {
            return SqlVerdict::rejected_all(findings.functions);
        }
        if self.block_system_catalogs && !findings.catalogs.is_empty() {
            return SqlVerdict::rejected_all(findings.catalogs);
        }

        let warnings = performance_warnings(query);
        debug!(warnings = warnings.len(), "SQL accepted by validator");

        SqlVerdict {
            valid: true,
            errors: Vec::new(),
            warnings,
            cleaned_sql: Some(cleaned.trim_end_matches(';').trim_end().to_string()),
        }
    }
}

fn forbidden_message(statement: &Statement) -> String {
    let kind = StatementKind::of(statement);
    if kind == StatementKind::Command {
        let keyword = statement
            .to_string()
            .split_whitespace()
            .next()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        format!(
            "Statement type '{}' is not allowed (only SELECT queries permitted)",
            keyword
        )
    } else {
        format!(
            "{} statements are not allowed (read-only queries only)",
            kind.label()
        )
    }
}

/// Root query bodies other than SELECT and set operations over SELECTs.
fn unsupported_body(body: &SetExpr) -> Option<&'static str> {
    match body {
        SetExpr::Select(_) => None,
        SetExpr::Query(query) => unsupported_body(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            unsupported_body(left).or_else(|| unsupported_body(right))
        }
        SetExpr::Values(_) => Some("VALUES"),
        SetExpr::Table(_) => Some("TABLE"),
        // Data-modifying bodies are reported with their statement kind by the visitor.
        _ => None,
    }
}

fn performance_warnings(query: &Query) -> Vec<String> {
    let mut warnings = Vec::new();

    if selects_wildcard(&query.body) {
        warnings.push(
            "SELECT * detected: consider specifying explicit columns for better performance"
                .to_string(),
        );
    }
    if query.limit.is_none() && query.fetch.is_none() {
        warnings.push(
            "no LIMIT clause detected: consider adding LIMIT to prevent large result sets"
                .to_string(),
        );
    }

    warnings
}

fn selects_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.projection.iter().any(|item| {
            matches!(
                item,
                SelectItem::Wildcard(..) | SelectItem::QualifiedWildcard(..)
            )
        }),
        SetExpr::Query(query) => selects_wildcard(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            selects_wildcard(left) || selects_wildcard(right)
        }
        _ => false,
    }
}

/// Lower-cased final segment of a possibly schema-qualified, quoted name.
pub(crate) fn base_name(name: &ObjectName) -> String {
    let rendered = name.to_string();
    let last = rendered.rsplit('.').next().unwrap_or(&rendered);
    last.trim_matches('"').to_lowercase()
}

fn is_dangerous_function(name: &ObjectName) -> bool {
    let base = base_name(name);
    DANGEROUS_FUNCTIONS.contains(&base.as_str())
}

/// Walks every node of the statement tree, nested queries included.
#[derive(Default)]
struct SafetyVisitor {
    forbidden: Vec<String>,
    functions: Vec<String>,
    catalogs: Vec<String>,
}

impl SafetyVisitor {
    fn push_unique(list: &mut Vec<String>, message: String) {
        if !list.contains(&message) {
            list.push(message);
        }
    }

    fn check_function(&mut self, name: &ObjectName) {
        if is_dangerous_function(name) {
            Self::push_unique(
                &mut self.functions,
                format!(
                    "dangerous function '{}' is not allowed (potential security risk)",
                    base_name(name)
                ),
            );
        }
    }
}

impl Visitor for SafetyVisitor {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        let kind = StatementKind::of(statement);
        if !kind.is_read_only() {
            Self::push_unique(&mut self.forbidden, forbidden_message(statement));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if !query.locks.is_empty() {
            Self::push_unique(
                &mut self.forbidden,
                "Row locking clauses (FOR UPDATE/FOR SHARE) are not allowed (read-only queries only)"
                    .to_string(),
            );
        }
        if selects_into(&query.body) {
            Self::push_unique(
                &mut self.forbidden,
                "SELECT INTO statements are not allowed (read-only queries only)".to_string(),
            );
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        if let Expr::Function(function) = expr {
            self.check_function(&function.name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        if let TableFactor::Function { name, .. } = table_factor {
            self.check_function(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        // Set-returning functions in FROM surface as relations.
        self.check_function(relation);

        let rendered = relation.to_string().to_lowercase();
        let first = rendered.split('.').next().unwrap_or("").trim_matches('"');
        let base = base_name(relation);
        if SYSTEM_SCHEMAS.contains(&first) || base.starts_with("pg_") {
            Self::push_unique(
                &mut self.catalogs,
                format!(
                    "access to system catalog '{}' is not allowed",
                    relation
                ),
            );
        }
        ControlFlow::Continue(())
    }
}

fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

/// Removes `--` line comments and `/* */` block comments (nested, as in
/// PostgreSQL) while leaving string literals and quoted identifiers intact.
pub fn strip_comments(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                result.push(c);
                while let Some(inner) = chars.next() {
                    result.push(inner);
                    if inner == c {
                        // Doubled quote is an escaped quote, not the end.
                        if chars.peek() == Some(&c) {
                            if let Some(escaped) = chars.next() {
                                result.push(escaped);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut depth = 1;
                let mut prev = '\0';
                while let Some(inner) = chars.next() {
                    if prev == '/' && inner == '*' {
                        depth += 1;
                        prev = '\0';
                        continue;
                    }
                    if prev == '*' && inner == '/' {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                        prev = '\0';
                        continue;
                    }
                    prev = inner;
                }
                result.push(' ');
            }
            _ => result.push(c),
        }
    }

    result
}
