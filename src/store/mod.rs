//! Column store abstraction
//!
//! The data plane talks to the wide `metrics` table through two narrow
//! seams:
//!
//! - [`AnalyticsStore::begin`] opens an [`InsertTransaction`] used by the
//!   ingestion consumer to write buckets in bulk
//! - [`AnalyticsStore::query`] runs a [`BoundQuery`] and returns loosely
//!   typed rows plus the grand-total row produced by `WITH TOTALS`
//!
//! Queries carry their values as positional parameters. SQL text only ever
//! contains identifiers from the fixed column tables and the escaped
//! row-visibility predicate.

pub mod clickhouse;
pub mod memory;
pub mod schema;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::StoreError;
use crate::types::MetricBucket;

pub use self::clickhouse::{ClickHouseConfig, ClickHouseStore};
pub use memory::RecordingStore;

/// Name of the wide metrics table
pub const METRICS_TABLE: &str = "metrics";

// ============================================================================
// Queries
// ============================================================================

/// Positional query parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// String literal
    Str(String),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Array of strings
    StrList(Vec<String>),
    /// Array of unsigned integers
    UIntList(Vec<u64>),
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Str(s) => write!(f, "{:?}", s),
            Param::Int(v) => write!(f, "{}", v),
            Param::UInt(v) => write!(f, "{}", v),
            Param::Float(v) => write!(f, "{}", v),
            Param::StrList(v) => write!(f, "{:?}", v),
            Param::UIntList(v) => write!(f, "{:?}", v),
        }
    }
}

/// SQL text with `?` placeholders and their values, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundQuery {
    sql: String,
    params: Vec<Param>,
}

impl BoundQuery {
    /// Build from rendered parts; the placeholder count must match
    pub fn new(sql: impl Into<String>, params: Vec<Param>) -> Self {
        let sql = sql.into();
        debug_assert_eq!(
            count_placeholders(&sql),
            params.len(),
            "placeholder count mismatch in {}",
            sql
        );
        Self { sql, params }
    }

    /// SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameters in placeholder order
    pub fn params(&self) -> &[Param] {
        &self.params
    }
}

/// Count single `?` placeholders, skipping escaped `??`
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '?' {
            if chars.peek() == Some(&'?') {
                chars.next();
            } else {
                count += 1;
            }
        }
    }
    count
}

/// Escape the binder's placeholder character in spliced SQL text
pub fn escape_placeholders(sql: &str) -> String {
    sql.replace('?', "??")
}

// ============================================================================
// Results
// ============================================================================

/// One result row keyed by column alias
pub type Row = Map<String, Value>;

/// Rows of a query plus the `WITH TOTALS` row when requested
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    /// Grouped rows in store order
    pub rows: Vec<Row>,
    /// Grand total row
    pub totals: Option<Row>,
}

impl QueryOutput {
    /// Output with rows only
    pub fn rows(rows: Vec<Row>) -> Self {
        Self { rows, totals: None }
    }

    /// Output with rows and a totals row
    pub fn with_totals(rows: Vec<Row>, totals: Row) -> Self {
        Self {
            rows,
            totals: Some(totals),
        }
    }
}

/// Lenient typed access to result rows
///
/// The store may render 64-bit integers as JSON strings and non-finite
/// floats as `null`, so numeric getters accept both forms.
pub trait RowExt {
    /// Numeric column, `None` when absent, null or unparsable
    fn opt_f64(&self, column: &str) -> Option<f64>;

    /// Numeric column, zero when missing
    fn f64_or_zero(&self, column: &str) -> f64 {
        self.opt_f64(column).unwrap_or(0.0)
    }

    /// Numeric column, NaN when missing or null
    fn f64_or_nan(&self, column: &str) -> f64 {
        self.opt_f64(column).unwrap_or(f64::NAN)
    }

    /// Unsigned integer column, zero when missing
    fn u64_or_zero(&self, column: &str) -> u64;

    /// String column, empty when missing; numbers are rendered
    fn string(&self, column: &str) -> String;

    /// Array-of-strings column, empty when missing
    fn string_list(&self, column: &str) -> Vec<String>;
}

impl RowExt for Row {
    fn opt_f64(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => match s.as_str() {
                "nan" | "NaN" | "-nan" => Some(f64::NAN),
                "inf" | "+inf" => Some(f64::INFINITY),
                "-inf" => Some(f64::NEG_INFINITY),
                other => other.parse().ok(),
            },
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn u64_or_zero(&self, column: &str) -> u64 {
        match self.get(column) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn string(&self, column: &str) -> String {
        match self.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    fn string_list(&self, column: &str) -> Vec<String> {
        match self.get(column) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// Column store used by the ingestion consumer and the query engine
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Open a bulk insert transaction
    async fn begin(&self) -> Result<Box<dyn InsertTransaction>, StoreError>;

    /// Run a read query
    async fn query(&self, query: &BoundQuery) -> Result<QueryOutput, StoreError>;

    /// Run a statement that returns no rows
    async fn execute(&self, query: &BoundQuery) -> Result<(), StoreError>;
}

/// Bulk insert of buckets that becomes visible on commit
#[async_trait]
pub trait InsertTransaction: Send {
    /// Stage one bucket
    async fn insert(&mut self, bucket: &MetricBucket) -> Result<(), StoreError>;

    /// Write every staged bucket, returning how many were written
    async fn commit(self: Box<Self>) -> Result<usize, StoreError>;

    /// Discard every staged bucket
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_count_placeholders_skips_escaped() {
        assert_eq!(count_placeholders("a = ? AND b = ?"), 2);
        assert_eq!(count_placeholders("match(x, 'colou??r') AND y = ?"), 1);
        assert_eq!(escape_placeholders("colou?r"), "colou??r");
    }

    #[test]
    fn test_row_numeric_leniency() {
        let r = row(json!({
            "a": 1.5,
            "b": "18446744073709551615",
            "c": null,
            "d": "nan",
            "e": "12"
        }));
        assert_eq!(r.f64_or_zero("a"), 1.5);
        assert_eq!(r.u64_or_zero("b"), u64::MAX);
        assert_eq!(r.f64_or_zero("c"), 0.0);
        assert!(r.f64_or_nan("c").is_nan());
        assert!(r.f64_or_zero("d").is_nan());
        assert_eq!(r.f64_or_zero("e"), 12.0);
        assert_eq!(r.f64_or_zero("missing"), 0.0);
    }

    #[test]
    fn test_row_strings() {
        let r = row(json!({"s": "x", "n": 3, "l": ["a", "b"]}));
        assert_eq!(r.string("s"), "x");
        assert_eq!(r.string("n"), "3");
        assert_eq!(r.string("missing"), "");
        assert_eq!(r.string_list("l"), vec!["a", "b"]);
        assert!(r.string_list("s").is_empty());
    }
}
