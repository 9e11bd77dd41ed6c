use crate::db::DbError;
use crate::db::models::{ColumnDescriptor, QueryResult};
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::error::SqlState;
use postgres::types::{FromSql, Type};
use postgres::{Client, Row};
use serde_json::{Map, Number, Value};
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::debug;

/// Runs one already-validated statement on a checked-out connection.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait QueryRunner<C>: Send + Sync {
    fn run(&self, conn: &mut C, sql: &str, limit: usize, timeout: Duration) -> Result<QueryResult, DbError>;
}

/// Executes inside a read-only transaction with a per-transaction statement timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgQueryRunner;

impl QueryRunner<Client> for PgQueryRunner {
    fn run(&self, conn: &mut Client, sql: &str, limit: usize, timeout: Duration) -> Result<QueryResult, DbError> {
        let started = Instant::now();

        let mut transaction = conn
            .build_transaction()
            .read_only(true)
            .start()
            .map_err(|e| classify_pg_error(e, timeout))?;

        transaction
            .batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
            .map_err(|e| classify_pg_error(e, timeout))?;

        let statement = transaction.prepare(sql).map_err(|e| classify_pg_error(e, timeout))?;
        let columns: Vec<ColumnDescriptor> = statement
            .columns()
            .iter()
            .map(|column| ColumnDescriptor {
                name: column.name().to_string(),
                data_type: column.type_().name().to_string(),
            })
            .collect();

        // A portal lets the server stop after one row past the limit instead
        // of sending the whole result.
        let portal = transaction.bind(&statement, &[]).map_err(|e| classify_pg_error(e, timeout))?;
        let rows = transaction
            .query_portal(&portal, portal_fetch_size(limit))
            .map_err(|e| classify_pg_error(e, timeout))?;
        // Nothing to keep from a read-only transaction.
        transaction.rollback().map_err(|e| classify_pg_error(e, timeout))?;

        let mut mapped = Vec::with_capacity(rows.len());
        for row in &rows {
            mapped.push(row_to_map(row)?);
        }

        debug!(rows = rows.len(), columns = columns.len(), "Query returned");
        Ok(QueryResult::from_rows(columns, mapped, limit, started.elapsed()))
    }
}

/// Rows requested from the portal. Zero would mean "all rows", so the
/// result is never below one.
fn portal_fetch_size(limit: usize) -> i32 {
    i32::try_from(limit.saturating_add(1)).unwrap_or(i32::MAX)
}

fn classify_pg_error(error: postgres::Error, timeout: Duration) -> DbError {
    if error.is_closed() {
        return DbError::connection(error.to_string());
    }

    let Some(db_error) = error.as_db_error() else {
        // Errors without a server response are I/O or protocol failures.
        return DbError::connection(error.to_string());
    };

    let code = db_error.code();
    let message = db_error.message();
    if *code == SqlState::QUERY_CANCELED {
        debug!(server_message = message, "Statement cancelled by server");
        DbError::Timeout { millis: timeout.as_millis() as u64 }
    } else if *code == SqlState::INSUFFICIENT_PRIVILEGE {
        DbError::execution(format!("Permission denied: {}", message))
    } else if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_COLUMN {
        DbError::execution(format!("Unknown table or column: {}", message))
    } else if *code == SqlState::SYNTAX_ERROR {
        DbError::execution(format!("SQL syntax error: {}", message))
    } else if *code == SqlState::READ_ONLY_SQL_TRANSACTION {
        DbError::execution(format!("Write attempted in read-only transaction: {}", message))
    } else if *code == SqlState::ADMIN_SHUTDOWN || *code == SqlState::CONNECTION_FAILURE {
        DbError::connection(message.to_string())
    } else {
        DbError::execution(message.to_string())
    }
}

fn row_to_map(row: &Row) -> Result<Map<String, Value>, DbError> {
    let mut map = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx).map_err(|e| {
            DbError::execution(format!("Failed to decode column '{}': {}", column.name(), e))
        })?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn float_value(v: f64) -> Value {
    // NaN and infinities have no JSON representation.
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn column_value(row: &Row, idx: usize) -> Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| float_value(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(float_value),
        Type::NUMERIC => row
            .try_get::<_, Option<NumericText>>(idx)?
            .map(|n| Value::String(n.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)?
            .map(|items| Value::Array(items.into_iter().map(|s| s.map_or(Value::Null, Value::String)).collect())),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<Option<i32>>>>(idx)?
            .map(|items| Value::Array(items.into_iter().map(|n| n.map_or(Value::Null, Value::from)).collect())),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(idx)?
            .map(|items| Value::Array(items.into_iter().map(|n| n.map_or(Value::Null, Value::from)).collect())),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::String),
            Err(_) => {
                debug!(column = idx, pg_type = %ty, "No JSON mapping for column type");
                None
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

/// NUMERIC decoded to its exact decimal text.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(NumericText)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary NUMERIC layout: ndigits, weight, sign, dscale (all 16-bit), then
/// `ndigits` base-10000 digits.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn StdError + Sync + Send>> {
    let read_u16 = |at: usize| -> Result<u16, Box<dyn StdError + Sync + Send>> {
        raw.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".into())
    };

    let ndigits = read_u16(0)? as usize;
    let weight = read_u16(2)? as i16 as i32;
    let sign = read_u16(4)?;
    let dscale = read_u16(6)? as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        digits.push(read_u16(8 + 2 * i)?);
    }
    let digit_at = |i: i32| -> u16 {
        if i < 0 { 0 } else { digits.get(i as usize).copied().unwrap_or(0) }
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(text, "{}", digit_at(i));
            } else {
                let _ = write!(text, "{:04}", digit_at(i));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", digit_at(i));
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}
