//! QAN analytics - query analytics data plane over a wide column store
//!
//! This library provides the data plane behind query analytics:
//! - Time-window batching of agent metric buckets into store transactions
//! - Report, metrics, sparkline, filter and histogram queries over the
//!   wide `metrics` table
//! - Translation of row-visibility selectors into SQL predicates
//! - Partition-based retention

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod columns;
pub mod error;
pub mod store;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Bounded queue and time-window batcher for collect requests
pub mod ingestion;

/// Report and metrics query engine
pub mod query;

/// Row-visibility selector translation
pub mod selector;

/// Periodic partition pruning
pub mod retention;

// Re-export main types
pub use error::{Error, Result};
pub use ingestion::{Ingester, IngestionConfig};
pub use query::QueryEngine;
pub use selector::Selector;
pub use store::{AnalyticsStore, ClickHouseStore, RecordingStore};
pub use types::{CollectBatch, MetricBucket, TimeRange};
