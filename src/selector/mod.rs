//! Label-based access control selectors
//!
//! A row-visibility restriction arrives as an out-of-band header holding a
//! base64-encoded JSON array of selector strings:
//!
//! ```text
//! X-Proxy-Filter: base64(["{service_type=~\"mysql|mongodb\"}", "{environment=\"dev\", az!=\"us-east-1\"}"])
//! ```
//!
//! Each string is a conjunction of matchers; the strings are disjoined. The
//! translator turns that into one boolean SQL expression, distinguishing the
//! fixed dimension columns from open-ended label keys:
//!
//! | operator | dimension column      | label key                                                              |
//! |----------|-----------------------|------------------------------------------------------------------------|
//! | `=`      | `col = 'v'`           | `(hasAny(labels.key, ['k']) AND hasAny(labels.value, ['v']))`          |
//! | `!=`     | `col != 'v'`          | `NOT (hasAny(labels.key, ['k']) AND hasAny(labels.value, ['v']))`      |
//! | `=~`     | `match(col, 'v')`     | `(hasAny(labels.key, ['k']) AND arrayExists(x -> match(x, 'v'), labels.value))` |
//! | `!~`     | `NOT match(col, 'v')` | `NOT (...)` of the line above                                          |
//!
//! Decoding is strict: bad base64, bad JSON, a malformed selector or an
//! unknown operator fails the request. An absent or empty header means no
//! restriction.
//!
//! # Example
//!
//! ```rust
//! use qan_analytics::selector::Selector;
//!
//! let selector = Selector::parse_all(&[
//!     r#"{service_type="mysql"}"#,
//!     r#"{team="db", environment!="prod"}"#,
//! ])
//! .unwrap();
//!
//! assert_eq!(
//!     selector.to_sql().unwrap().as_str(),
//!     "service_type = 'mysql' OR ((hasAny(labels.key, ['team']) AND hasAny(labels.value, ['db'])) AND environment != 'prod')"
//! );
//! ```

mod parser;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::columns::is_dimension;

/// Header carrying the row-visibility selector
pub const LBAC_HEADER: &str = "X-Proxy-Filter";

/// Selector decoding and translation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// Header is not valid base64
    #[error("header is not valid base64: {0}")]
    Base64(String),

    /// Decoded header is not a JSON array of strings
    #[error("header is not a JSON array of strings: {0}")]
    Json(String),

    /// Selector string is malformed
    #[error("{0}")]
    Parse(String),

    /// Matcher uses an operator outside `=`, `!=`, `=~`, `!~`
    #[error("unsupported matcher operator '{op}' for label {name}")]
    UnsupportedOperator {
        /// Label the operator was applied to
        name: String,
        /// Operator as written
        op: String,
    },

    /// Regex matcher value does not compile
    #[error("invalid regex for label {name}: {reason}")]
    InvalidRegex {
        /// Label the regex was applied to
        name: String,
        /// Compiler message
        reason: String,
    },
}

// ============================================================================
// Matchers
// ============================================================================

/// Matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    RegexMatch,
    /// `!~`
    RegexNotMatch,
}

impl FromStr for MatchOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(MatchOp::Equal),
            "!=" => Ok(MatchOp::NotEqual),
            "=~" => Ok(MatchOp::RegexMatch),
            "!~" => Ok(MatchOp::RegexNotMatch),
            _ => Err(()),
        }
    }
}

impl MatchOp {
    fn is_regex(self) -> bool {
        matches!(self, MatchOp::RegexMatch | MatchOp::RegexNotMatch)
    }

    fn is_negated(self) -> bool {
        matches!(self, MatchOp::NotEqual | MatchOp::RegexNotMatch)
    }
}

/// One `name OP value` matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    /// Dimension column or label key
    pub name: String,
    /// Operator
    pub op: MatchOp,
    /// Literal or regex value
    pub value: String,
}

impl Matcher {
    /// Create a matcher
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    fn to_sql(&self) -> String {
        let value = escape_literal(&self.value);
        if is_dimension(&self.name) {
            // Dimension names are drawn from a fixed set, safe as identifiers.
            return match self.op {
                MatchOp::Equal => format!("{} = '{}'", self.name, value),
                MatchOp::NotEqual => format!("{} != '{}'", self.name, value),
                MatchOp::RegexMatch => format!("match({}, '{}')", self.name, value),
                MatchOp::RegexNotMatch => format!("NOT match({}, '{}')", self.name, value),
            };
        }

        let key = escape_literal(&self.name);
        let values = if self.op.is_regex() {
            format!("arrayExists(x -> match(x, '{}'), labels.value)", value)
        } else {
            format!("hasAny(labels.value, ['{}'])", value)
        };
        let condition = format!("(hasAny(labels.key, ['{}']) AND {})", key, values);
        if self.op.is_negated() {
            format!("NOT {}", condition)
        } else {
            condition
        }
    }
}

/// Conjunction of matchers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherSet {
    /// Matchers, AND-joined
    pub matchers: Vec<Matcher>,
}

impl MatcherSet {
    /// Parse one selector string such as `{a="1", b=~"x.*"}`
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let raw = parser::parse_selector(input)?;
        if raw.is_empty() {
            return Err(SelectorError::Parse(format!(
                "selector {:?} must contain at least one matcher",
                input
            )));
        }

        let mut matchers = Vec::with_capacity(raw.len());
        for m in raw {
            let op = m
                .op
                .parse::<MatchOp>()
                .map_err(|_| SelectorError::UnsupportedOperator {
                    name: m.name.to_string(),
                    op: m.op.to_string(),
                })?;
            if op.is_regex() {
                regex::Regex::new(&m.value).map_err(|e| SelectorError::InvalidRegex {
                    name: m.name.to_string(),
                    reason: e.to_string(),
                })?;
            }
            matchers.push(Matcher::new(m.name, op, m.value));
        }
        Ok(Self { matchers })
    }

    fn to_sql(&self) -> String {
        self.matchers
            .iter()
            .map(Matcher::to_sql)
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Disjunction of matcher sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// Matcher sets, OR-joined
    pub sets: Vec<MatcherSet>,
}

impl Selector {
    /// No restriction
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// True if the selector imposes no restriction
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Parse a list of selector strings
    pub fn parse_all<S: AsRef<str>>(selectors: &[S]) -> Result<Self, SelectorError> {
        let sets = selectors
            .iter()
            .map(|s| MatcherSet::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sets })
    }

    /// Decode the header value; `None` or blank means unrestricted
    pub fn from_header(header: Option<&str>) -> Result<Self, SelectorError> {
        let header = match header.map(str::trim) {
            Some(h) if !h.is_empty() => h,
            _ => return Ok(Self::unrestricted()),
        };

        let selectors = decode_header(header).map_err(|e| {
            warn!("Rejecting row filter header: {}", e);
            e
        })?;
        Self::parse_all(&selectors).map_err(|e| {
            warn!("Rejecting row filter selector: {}", e);
            e
        })
    }

    /// Translate into a SQL predicate, `None` when unrestricted
    pub fn to_sql(&self) -> Option<RowFilter> {
        if self.sets.is_empty() {
            return None;
        }
        let wrap = self.sets.len() > 1;
        let sql = self
            .sets
            .iter()
            .map(|set| {
                let sql = set.to_sql();
                if wrap && set.matchers.len() > 1 {
                    format!("({})", sql)
                } else {
                    sql
                }
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        Some(RowFilter(sql))
    }
}

/// Decode a base64 JSON array of selector strings
pub fn decode_header(header: &str) -> Result<Vec<String>, SelectorError> {
    let bytes = STANDARD
        .decode(header)
        .map_err(|e| SelectorError::Base64(e.to_string()))?;
    serde_json::from_slice::<Vec<String>>(&bytes).map_err(|e| SelectorError::Json(e.to_string()))
}

/// Escape a value for a single-quoted string literal
///
/// Backslashes are doubled first, then single quotes are doubled.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// Translated row-visibility predicate
///
/// Only the translator can build one, so every literal inside has been
/// escaped. The query builder splices it as a single parenthesized clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter(String);

impl RowFilter {
    /// SQL text of the predicate
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(selectors: &[&str]) -> String {
        Selector::parse_all(selectors)
            .unwrap()
            .to_sql()
            .map(|f| f.as_str().to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_dimension_equal() {
        assert_eq!(sql(&[r#"{service_type="mysql"}"#]), "service_type = 'mysql'");
    }

    #[test]
    fn test_label_equal() {
        assert_eq!(
            sql(&[r#"{custom_label="value"}"#]),
            "(hasAny(labels.key, ['custom_label']) AND hasAny(labels.value, ['value']))"
        );
    }

    #[test]
    fn test_two_sets_or_joined() {
        assert_eq!(sql(&[r#"{az="1"}"#, r#"{region="2"}"#]), "az = '1' OR region = '2'");
    }

    #[test]
    fn test_multi_matcher_set_parenthesized_with_other_sets() {
        assert_eq!(
            sql(&[r#"{environment="dev", az!="us-east-1"}"#, r#"{cluster="c1"}"#]),
            "(environment = 'dev' AND az != 'us-east-1') OR cluster = 'c1'"
        );
    }

    #[test]
    fn test_single_multi_matcher_set_not_parenthesized() {
        assert_eq!(
            sql(&[r#"{environment="dev", az!="us-east-1"}"#]),
            "environment = 'dev' AND az != 'us-east-1'"
        );
    }

    #[test]
    fn test_regex_operators() {
        assert_eq!(
            sql(&[r#"{service_type=~"mysql|mongodb"}"#]),
            "match(service_type, 'mysql|mongodb')"
        );
        assert_eq!(
            sql(&[r#"{environment!~"prod.*"}"#]),
            "NOT match(environment, 'prod.*')"
        );
        assert_eq!(
            sql(&[r#"{team=~"db.*"}"#]),
            "(hasAny(labels.key, ['team']) AND arrayExists(x -> match(x, 'db.*'), labels.value))"
        );
        assert_eq!(
            sql(&[r#"{team!~"db.*"}"#]),
            "NOT (hasAny(labels.key, ['team']) AND arrayExists(x -> match(x, 'db.*'), labels.value))"
        );
    }

    #[test]
    fn test_label_not_equal() {
        assert_eq!(
            sql(&[r#"{team!="ops"}"#]),
            "NOT (hasAny(labels.key, ['team']) AND hasAny(labels.value, ['ops']))"
        );
    }

    #[test]
    fn test_values_are_escaped() {
        assert_eq!(
            sql(&[r#"{service_name="o'brien"}"#]),
            "service_name = 'o''brien'"
        );
        assert_eq!(
            sql(&[r#"{service_name="a\\b"}"#]),
            r"service_name = 'a\\b'"
        );
        assert_eq!(
            sql(&[r#"{service_name="x' OR 1=1 --"}"#]),
            "service_name = 'x'' OR 1=1 --'"
        );
    }

    #[test]
    fn test_empty_header_is_unrestricted() {
        assert!(Selector::from_header(None).unwrap().is_empty());
        assert!(Selector::from_header(Some("  ")).unwrap().to_sql().is_none());
    }

    #[test]
    fn test_header_round_trip() {
        let header = STANDARD.encode(r#"["{service_type=\"mysql\"}", "{az=\"a\"}"]"#);
        let selector = Selector::from_header(Some(&header)).unwrap();
        assert_eq!(
            selector.to_sql().unwrap().as_str(),
            "service_type = 'mysql' OR az = 'a'"
        );
    }

    #[test]
    fn test_bad_base64_fails() {
        let err = Selector::from_header(Some("%%%not-base64")).unwrap_err();
        assert!(matches!(err, SelectorError::Base64(_)));
    }

    #[test]
    fn test_bad_json_fails() {
        let header = STANDARD.encode("{\"not\": \"an array\"}");
        let err = Selector::from_header(Some(&header)).unwrap_err();
        assert!(matches!(err, SelectorError::Json(_)));
    }

    #[test]
    fn test_bad_selector_fails() {
        let header = STANDARD.encode(r#"["service_type=mysql"]"#);
        let err = Selector::from_header(Some(&header)).unwrap_err();
        assert!(matches!(err, SelectorError::Parse(_)));
    }

    #[test]
    fn test_unsupported_operator_fails() {
        let err = Selector::parse_all(&[r#"{a=="1"}"#]).unwrap_err();
        assert_eq!(
            err,
            SelectorError::UnsupportedOperator {
                name: "a".to_string(),
                op: "==".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_regex_fails() {
        let err = Selector::parse_all(&[r#"{a=~"("}"#]).unwrap_err();
        assert!(matches!(err, SelectorError::InvalidRegex { .. }));
    }

    #[test]
    fn test_empty_matcher_set_fails() {
        assert!(Selector::parse_all(&["{}"]).is_err());
    }

    #[test]
    fn test_empty_array_is_unrestricted() {
        let header = STANDARD.encode("[]");
        let selector = Selector::from_header(Some(&header)).unwrap();
        assert!(selector.to_sql().is_none());
    }
}
