//! Query error types
//!
//! Every read operation fails with a `QueryError` carrying the kind, the
//! operation it came from and a message naming the offending field.

use std::fmt;

use crate::error::StoreError;
use crate::selector::SelectorError;

/// Query error with context
#[derive(Debug)]
pub struct QueryError {
    /// Error kind for programmatic handling
    pub kind: QueryErrorKind,
    /// Operation that failed, e.g. `GetReport`
    pub operation: Option<&'static str>,
    /// Human-readable message
    pub message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    /// Create a new query error
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: None,
            message: message.into(),
            source: None,
        }
    }

    /// Add source error for error chaining
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the operation name unless one is already set
    pub fn in_operation(mut self, operation: &'static str) -> Self {
        self.operation.get_or_insert(operation);
        self
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Validation, message)
    }

    /// Create a decoding error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Decode, message)
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::NotFound, message)
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Storage, message)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Timeout, message)
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(QueryErrorKind::Internal, message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operation {
            Some(op) => write!(f, "{}: {}: {}", self.kind, op, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::Decode(_) => QueryErrorKind::Internal,
            _ => QueryErrorKind::Storage,
        };
        QueryError::new(kind, err.to_string()).with_source(err)
    }
}

impl From<SelectorError> for QueryError {
    fn from(err: SelectorError) -> Self {
        QueryError::decode(format!("invalid row filter: {}", err)).with_source(err)
    }
}

/// Categories of query errors for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Request failed validation (time range, group, order column)
    Validation,
    /// A header or payload could not be decoded
    Decode,
    /// The requested object does not exist
    NotFound,
    /// The store rejected or failed the query
    Storage,
    /// The query exceeded its deadline
    Timeout,
    /// Unexpected state, e.g. a malformed store response
    Internal,
}

impl QueryErrorKind {
    /// Stable code for API responses
    pub fn code(self) -> &'static str {
        match self {
            QueryErrorKind::Validation => "invalid_argument",
            QueryErrorKind::Decode => "invalid_argument",
            QueryErrorKind::NotFound => "not_found",
            QueryErrorKind::Storage => "unavailable",
            QueryErrorKind::Timeout => "deadline_exceeded",
            QueryErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::Validation => write!(f, "ValidationError"),
            QueryErrorKind::Decode => write!(f, "DecodeError"),
            QueryErrorKind::NotFound => write!(f, "NotFound"),
            QueryErrorKind::Storage => write!(f, "StorageError"),
            QueryErrorKind::Timeout => write!(f, "Timeout"),
            QueryErrorKind::Internal => write!(f, "Internal"),
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_with_operation() {
        let err = QueryError::validation("unknown group dimension: foo").in_operation("GetReport");
        let display = err.to_string();
        assert_eq!(
            display,
            "ValidationError: GetReport: unknown group dimension: foo"
        );
    }

    #[test]
    fn test_first_operation_wins() {
        let err = QueryError::timeout("deadline exceeded")
            .in_operation("SelectSparklines")
            .in_operation("GetReport");
        assert_eq!(err.operation, Some("SelectSparklines"));
    }

    #[test]
    fn test_store_error_conversion() {
        use std::error::Error;
        let err: QueryError = StoreError::Query("table missing".into()).into();
        assert_eq!(err.kind, QueryErrorKind::Storage);
        assert!(err.source().is_some());
        assert!(err.message.contains("table missing"));
    }

    #[test]
    fn test_selector_error_is_decode() {
        let err: QueryError = SelectorError::Base64("bad padding".into()).into();
        assert_eq!(err.kind, QueryErrorKind::Decode);
        assert_eq!(err.kind.code(), "invalid_argument");
    }
}
