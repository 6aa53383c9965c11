//! Error types for the analytics data plane

use thiserror::Error;

use crate::query::error::QueryError;
use crate::selector::SelectorError;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Ingestion error
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Query error
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Selector error
    #[error("Selector error: {0}")]
    Selector(#[from] SelectorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the column store client
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach the store
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A read query failed
    #[error("Query failed: {0}")]
    Query(String),

    /// An insert or commit failed
    #[error("Insert failed: {0}")]
    Insert(String),

    /// The transaction was already finished
    #[error("Transaction already finished")]
    TransactionFinished,

    /// The response could not be decoded
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<clickhouse::error::Error> for StoreError {
    fn from(err: clickhouse::error::Error) -> Self {
        match err {
            clickhouse::error::Error::Network(e) => StoreError::Connection(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Ingestion errors
#[derive(Error, Debug)]
pub enum IngestionError {
    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The ingestion queue is closed
    #[error("Ingestion queue closed")]
    ChannelClosed,

    /// The consumer loop is already running or has finished
    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    /// Store failure while saving a batch
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
