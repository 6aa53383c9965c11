//! Core data types for the analytics data plane
//!
//! # Key Types
//!
//! - **`MetricBucket`**: One aggregation window for one distinct query on one
//!   monitored object
//! - **`CollectBatch`**: Ordered buckets delivered by one collect call
//! - **`Labels`**: Open-ended key/value tags stored as two aligned sequences
//! - **`MetricValues`**: The stored facets of one named metric
//! - **`TimeRange`**: Query window in unix seconds (inclusive)
//! - **`HistogramItem`**: One `{range, frequency}` bucket of a latency histogram
//!
//! # Example
//!
//! ```rust
//! use qan_analytics::types::{Labels, MetricBucket, MetricValues, TimeRange};
//!
//! let mut bucket = MetricBucket::new("Q1", 1_700_000_000, 60);
//! bucket.num_queries = 2;
//! bucket.metrics.insert("query_time".to_string(), MetricValues::sum_only(2.0, 10.0));
//! bucket.labels = Labels::from_pairs([("env", "prod")]);
//! assert!(bucket.validate().is_ok());
//!
//! let range = TimeRange::new(1_700_000_000, 1_700_000_060).unwrap();
//! assert_eq!(range.duration_secs(), 60);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::columns::{self, Dimension};
use crate::query::error::{QueryError, QueryResult};

// ============================================================================
// Labels
// ============================================================================

/// Open-ended labels as two index-aligned sequences
///
/// Keys and values always have the same length; the only way to build a
/// `Labels` from raw sequences is [`Labels::from_parallel`], which checks it.
/// Pairs are kept sorted by key so that the stored arrays are deterministic.
///
/// # Example
///
/// ```rust
/// use qan_analytics::types::Labels;
///
/// let labels = Labels::from_pairs([("region", "eu"), ("env", "prod")]);
/// assert_eq!(labels.keys(), &["env".to_string(), "region".to_string()]);
/// assert_eq!(labels.get("region"), Some("eu"));
///
/// assert!(Labels::from_parallel(vec!["a".into()], vec![]).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Labels {
    keys: Vec<String>,
    values: Vec<String>,
}

/// Keys and values had different lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelsLengthMismatch {
    /// Number of keys
    pub keys: usize,
    /// Number of values
    pub values: usize,
}

impl fmt::Display for LabelsLengthMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "label keys and values differ in length ({} keys, {} values)",
            self.keys, self.values
        )
    }
}

impl std::error::Error for LabelsLengthMismatch {}

impl Labels {
    /// Create an empty label set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs; a repeated key keeps the last value
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<String, String>>()
            .into()
    }

    /// Build from the stored parallel arrays
    pub fn from_parallel(
        keys: Vec<String>,
        values: Vec<String>,
    ) -> Result<Self, LabelsLengthMismatch> {
        if keys.len() != values.len() {
            return Err(LabelsLengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        Ok(Self::from_pairs(keys.into_iter().zip(values)))
    }

    /// Insert or replace a label
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.keys.binary_search(&key) {
            Ok(idx) => self.values[idx] = value.into(),
            Err(idx) => {
                self.keys.insert(idx, key);
                self.values.insert(idx, value.into());
            }
        }
    }

    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys
            .binary_search_by(|k| k.as_str().cmp(key))
            .ok()
            .map(|idx| self.values[idx].as_str())
    }

    /// Keys in sorted order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Values aligned with [`Labels::keys`]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Iterate pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys
            .iter()
            .zip(&self.values)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if there are no labels
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        let (keys, values) = map.into_iter().unzip();
        Self { keys, values }
    }
}

impl From<Labels> for BTreeMap<String, String> {
    fn from(labels: Labels) -> Self {
        labels.keys.into_iter().zip(labels.values).collect()
    }
}

// ============================================================================
// Metric values
// ============================================================================

/// Stored facets of one metric in one bucket
///
/// Counter metrics only use `cnt` and `sum`; the remaining facets are ignored
/// for them when the bucket is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricValues {
    /// Number of samples that carried the metric
    pub cnt: f32,
    /// Sum of values
    pub sum: f32,
    /// Minimum value
    pub min: f32,
    /// Maximum value
    pub max: f32,
    /// Approximate 99th percentile
    pub p99: f32,
}

impl MetricValues {
    /// Values for a counter metric, or a common metric without spread
    pub fn sum_only(cnt: f32, sum: f32) -> Self {
        Self {
            cnt,
            sum,
            ..Self::default()
        }
    }
}

// ============================================================================
// Histogram
// ============================================================================

/// One latency histogram bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramItem {
    /// Range label, e.g. `"(0-3)"`
    pub range: String,
    /// Number of queries that fell into the range
    pub frequency: u64,
}

// ============================================================================
// Metric bucket
// ============================================================================

/// Kind of example payload carried by a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleType {
    /// No example
    #[default]
    Invalid,
    /// Random sample of the query
    Random,
    /// The slowest execution in the period
    Slowest,
    /// The fastest execution in the period
    Fastest,
    /// Execution that raised an error
    WithError,
}

impl ExampleType {
    /// Numeric code stored in the table
    pub fn code(self) -> u8 {
        match self {
            ExampleType::Invalid => 0,
            ExampleType::Random => 1,
            ExampleType::Slowest => 2,
            ExampleType::Fastest => 3,
            ExampleType::WithError => 4,
        }
    }

    /// Decode a stored code, unknown codes map to `Invalid`
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => ExampleType::Random,
            2 => ExampleType::Slowest,
            3 => ExampleType::Fastest,
            4 => ExampleType::WithError,
            _ => ExampleType::Invalid,
        }
    }
}

/// One aggregation window of performance counters for one distinct query
///
/// Buckets are created by agents, delivered in a [`CollectBatch`], written
/// once and never updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricBucket {
    // --- identity ---
    /// Fingerprint hash of the query
    pub queryid: String,
    /// Monitored service
    pub service_id: String,
    /// Reporting agent
    pub agent_id: String,
    /// Window start, unix seconds
    pub period_start: i64,
    /// Window length in seconds
    pub period_length: u32,

    // --- dimensions ---
    /// Service name
    pub service_name: String,
    /// Database name
    pub database: String,
    /// Schema name
    pub schema: String,
    /// Database user
    pub username: String,
    /// Client host
    pub client_host: String,
    /// Replication set
    pub replication_set: String,
    /// Cluster
    pub cluster: String,
    /// Service type, e.g. `mysql`
    pub service_type: String,
    /// Environment
    pub environment: String,
    /// Availability zone
    pub az: String,
    /// Region
    pub region: String,
    /// Node model
    pub node_model: String,
    /// Node id
    pub node_id: String,
    /// Node name
    pub node_name: String,
    /// Node type
    pub node_type: String,
    /// Machine id
    pub machine_id: String,
    /// Container name
    pub container_name: String,
    /// Container id
    pub container_id: String,
    /// Agent type
    pub agent_type: String,
    /// Command type, e.g. `SELECT`
    pub cmd_type: String,
    /// Top-level parent query id
    pub top_queryid: String,
    /// Client application name
    pub application_name: String,
    /// Plan id
    pub planid: String,
    /// Plan summary
    pub plan_summary: String,

    /// Operator-defined labels
    pub labels: Labels,

    // --- opaque payload ---
    /// Normalized query text
    pub fingerprint: String,
    /// Fingerprint suitable for EXPLAIN
    pub explain_fingerprint: String,
    /// Number of placeholders in the explain fingerprint
    pub placeholders_count: u32,
    /// Tables touched by the query
    pub tables: Vec<String>,
    /// Example query text
    pub example: String,
    /// Kind of example
    pub example_type: ExampleType,
    /// Example was truncated by the agent
    pub is_truncated: bool,
    /// Text of the top-level query
    pub top_query: String,
    /// Query plan text
    pub query_plan: String,
    /// Latency histogram
    pub histogram_items: Vec<HistogramItem>,

    // --- counts ---
    /// Executions in the window
    pub num_queries: u32,
    /// Executions that raised an error
    pub num_queries_with_errors: u32,
    /// Executions that raised a warning
    pub num_queries_with_warnings: u32,
    /// Warning code to occurrence count
    pub warnings: BTreeMap<u64, u64>,
    /// Error code to occurrence count
    pub errors: BTreeMap<u64, u64>,

    /// Metric name to stored facets
    pub metrics: BTreeMap<String, MetricValues>,
}

impl MetricBucket {
    /// Create a bucket with its identity set
    pub fn new(queryid: impl Into<String>, period_start: i64, period_length: u32) -> Self {
        Self {
            queryid: queryid.into(),
            period_start,
            period_length,
            ..Self::default()
        }
    }

    /// Value of a dimension column
    pub fn dimension(&self, dim: Dimension) -> &str {
        match dim {
            Dimension::QueryId => &self.queryid,
            Dimension::ServiceName => &self.service_name,
            Dimension::Database => &self.database,
            Dimension::Schema => &self.schema,
            Dimension::Username => &self.username,
            Dimension::ClientHost => &self.client_host,
            Dimension::ReplicationSet => &self.replication_set,
            Dimension::Cluster => &self.cluster,
            Dimension::ServiceType => &self.service_type,
            Dimension::ServiceId => &self.service_id,
            Dimension::Environment => &self.environment,
            Dimension::Az => &self.az,
            Dimension::Region => &self.region,
            Dimension::NodeModel => &self.node_model,
            Dimension::NodeId => &self.node_id,
            Dimension::NodeName => &self.node_name,
            Dimension::NodeType => &self.node_type,
            Dimension::MachineId => &self.machine_id,
            Dimension::ContainerName => &self.container_name,
            Dimension::ContainerId => &self.container_id,
            Dimension::AgentId => &self.agent_id,
            Dimension::AgentType => &self.agent_type,
            Dimension::CmdType => &self.cmd_type,
            Dimension::TopQueryId => &self.top_queryid,
            Dimension::ApplicationName => &self.application_name,
            Dimension::PlanId => &self.planid,
            Dimension::PlanSummary => &self.plan_summary,
        }
    }

    /// Stored facets of a metric, zero when the agent did not report it
    pub fn metric(&self, name: &str) -> MetricValues {
        self.metrics.get(name).copied().unwrap_or_default()
    }

    /// Check the bucket before it is queued for storage
    pub fn validate(&self) -> Result<(), String> {
        if self.queryid.is_empty() {
            return Err("bucket has an empty queryid".to_string());
        }
        if self.period_start < 0 || self.period_start > i64::from(u32::MAX) {
            return Err(format!(
                "bucket {} has period_start {} outside the DateTime range",
                self.queryid, self.period_start
            ));
        }
        for name in self.metrics.keys() {
            match columns::classify(name) {
                Some(columns::MetricClass::Common) | Some(columns::MetricClass::Counter) => {}
                Some(columns::MetricClass::Special) => {
                    return Err(format!(
                        "bucket {} carries derived metric {} as a stored value",
                        self.queryid, name
                    ))
                }
                None => {
                    return Err(format!(
                        "bucket {} carries unknown metric {}",
                        self.queryid, name
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Ordered buckets delivered by one collect call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectBatch {
    /// Buckets in arrival order
    #[serde(default)]
    pub metrics_bucket: Vec<MetricBucket>,
}

impl CollectBatch {
    /// Wrap buckets
    pub fn new(buckets: Vec<MetricBucket>) -> Self {
        Self {
            metrics_bucket: buckets,
        }
    }

    /// Number of buckets
    pub fn len(&self) -> usize {
        self.metrics_bucket.len()
    }

    /// True if the batch carries no buckets
    pub fn is_empty(&self) -> bool {
        self.metrics_bucket.is_empty()
    }
}

// ============================================================================
// Time range
// ============================================================================

/// Query window over `period_start`, unix seconds, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start, unix seconds
    pub from: i64,
    /// End, unix seconds
    pub to: i64,
}

impl TimeRange {
    /// Create a validated range
    ///
    /// # Example
    ///
    /// ```rust
    /// use qan_analytics::types::TimeRange;
    ///
    /// assert!(TimeRange::new(60, 120).is_ok());
    /// assert!(TimeRange::new(120, 60).is_err());
    /// ```
    pub fn new(from: i64, to: i64) -> QueryResult<Self> {
        if from > to {
            return Err(QueryError::validation(format!(
                "from time {} is after to time {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Build from optional request fields, both of which are required
    pub fn from_request(from: Option<i64>, to: Option<i64>) -> QueryResult<Self> {
        match (from, to) {
            (Some(from), Some(to)) => Self::new(from, to),
            (None, _) => Err(QueryError::validation("from time is required")),
            (_, None) => Err(QueryError::validation("to time is required")),
        }
    }

    /// Window length in seconds, never less than one so rates stay finite
    pub fn duration_secs(&self) -> i64 {
        (self.to - self.from).max(1)
    }
}
