use sqlparser::ast::{Expr, GroupByExpr, SetExpr, Statement, Value, visit_expressions};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

use crate::sql::validator::base_name;

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count",
    "sum",
    "avg",
    "min",
    "max",
    "array_agg",
    "string_agg",
    "json_agg",
    "jsonb_agg",
    "bool_and",
    "bool_or",
    "every",
    "stddev",
    "variance",
];

/// Bounds the row count of a single SELECT.
///
/// - no row limit: `LIMIT min(requested, ceiling)` is appended
/// - literal limit above the ceiling: lowered to the ceiling
/// - limit expression or FETCH clause: the query is wrapped in an outer
///   `SELECT * ... LIMIT ceiling`
/// - text that does not parse as one query is returned unchanged
///
/// A plain aggregate without GROUP BY already yields one row and is exempt.
pub fn apply_row_limit(sql: &str, requested: usize, ceiling: usize) -> String {
    let effective = requested.min(ceiling);

    let mut statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(_) => return sql.to_string(),
    };
    if statements.len() != 1 {
        return sql.to_string();
    }
    let Some(Statement::Query(query)) = statements.first_mut() else {
        return sql.to_string();
    };

    let bound = match &query.limit {
        Some(Expr::Value(Value::Number(existing, _))) => match existing.parse::<u64>() {
            Ok(n) if n <= ceiling as u64 => Bound::Keep,
            Ok(_) => Bound::Set(ceiling),
            Err(_) => Bound::Wrap,
        },
        Some(_) => Bound::Wrap,
        None if query.fetch.is_some() => Bound::Wrap,
        None if is_ungrouped_aggregate(&query.body) => Bound::Keep,
        None => Bound::Set(effective),
    };

    match bound {
        Bound::Keep => sql.to_string(),
        Bound::Set(n) => {
            query.limit = Some(number(n));
            statements[0].to_string()
        }
        Bound::Wrap => format!("SELECT * FROM ({}) AS q LIMIT {}", statements[0], ceiling),
    }
}

enum Bound {
    Keep,
    Set(usize),
    Wrap,
}

fn number(n: usize) -> Expr {
    Expr::Value(Value::Number(n.to_string(), false))
}

fn is_ungrouped_aggregate(body: &SetExpr) -> bool {
    let SetExpr::Select(select) = body else {
        return false;
    };

    let grouped = match &select.group_by {
        GroupByExpr::All(..) => true,
        GroupByExpr::Expressions(exprs, ..) => !exprs.is_empty(),
    };
    if grouped {
        return false;
    }

    let found = visit_expressions(&select.projection, |expr| match expr {
        Expr::Function(function)
            if function.over.is_none()
                && AGGREGATE_FUNCTIONS.contains(&base_name(&function.name).as_str()) =>
        {
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    });
    found.is_break()
}
