//! Report and metrics query engine
//!
//! Read operations compile a request into a [`builder::SelectQuery`], run it
//! against the [`AnalyticsStore`] under a per-call deadline and shape the
//! loosely typed rows into response structs.
//!
//! ```text
//! Request ──► validate ──► SelectQuery ──► BoundQuery ──► store ──► rows
//!                              ▲                                     │
//!              row filter ─────┘                     stats, gap fill ▼
//!                                                                 Response
//! ```
//!
//! | operation                    | module        |
//! |------------------------------|---------------|
//! | `GetReport`                  | [`report`]    |
//! | `GetMetrics`                 | [`metrics`]   |
//! | `SelectSparklines`           | [`sparkline`] |
//! | `SelectFilters`, `GetLabels` | [`filters`]   |
//! | `GetHistogram`               | [`histogram`] |
//! | examples, plans, lookups     | [`details`]   |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qan_analytics::query::{QueryEngine, ReportRequest};
//! use qan_analytics::selector::Selector;
//! use qan_analytics::store::RecordingStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = QueryEngine::new(Arc::new(RecordingStore::new()));
//! let request = ReportRequest {
//!     period_start_from: Some(1_700_000_000),
//!     period_start_to: Some(1_700_003_600),
//!     group_by: "queryid".to_string(),
//!     columns: vec!["load".to_string(), "query_time".to_string()],
//!     order_by: "-load".to_string(),
//!     ..Default::default()
//! };
//! let report = engine.get_report(&request, &Selector::unrestricted()).await?;
//! println!("{} groups", report.total_rows);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod details;
pub mod error;
pub mod filters;
pub mod histogram;
pub mod metrics;
pub mod report;
pub mod sparkline;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::columns::{Dimension, GROUP_BY_DIMENSIONS};
use crate::selector::Selector;
use crate::store::{AnalyticsStore, QueryOutput};
use crate::types::TimeRange;
use builder::{LabelFilter, Predicate, SelectQuery};

pub use details::{
    ExplainFingerprint, QueryExample, QueryExampleRequest, QueryExamples, QueryPlan, SchemaInfo,
};
pub use error::{QueryError, QueryErrorKind, QueryResult};
pub use filters::{FilterValue, FiltersRequest, FiltersResponse, LabelsRequest, LabelsResponse};
pub use histogram::{HistogramRequest, HistogramResponse};
pub use metrics::{MetricSnapshot, MetricsRequest, MetricsResponse};
pub use report::{Report, ReportRequest, ReportRow, Stat};
pub use sparkline::{SparklinePlan, SparklinePoint, SparklineRequest};

/// Default deadline of one store call
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Engine
// ============================================================================

/// Read-side entry point shared by every request handler
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn AnalyticsStore>,
    timeout: Duration,
}

impl QueryEngine {
    /// Create an engine with the default per-call deadline
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Override the per-call deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-call deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one select under the deadline
    async fn fetch(&self, query: &SelectQuery) -> QueryResult<QueryOutput> {
        let bound = query.render();
        debug!("Query: {} params: {}", bound.sql(), bound.params().len());

        match tokio::time::timeout(self.timeout, self.store.query(&bound)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueryError::timeout(format!(
                "query exceeded {:?} deadline",
                self.timeout
            ))),
        }
    }

    /// Time an operation, tag its error with the operation name and
    /// record the outcome
    async fn instrument<T, F>(&self, operation: &'static str, fut: F) -> QueryResult<T>
    where
        F: Future<Output = QueryResult<T>>,
    {
        let start = Instant::now();
        let result = fut.await.map_err(|e| e.in_operation(operation));
        crate::metrics::record_query(operation, start.elapsed().as_secs_f64(), result.is_ok());
        result
    }
}

// ============================================================================
// Shared request plumbing
// ============================================================================

/// Dimension and label filters of a request
///
/// Requests carry a single `key -> values` map; keys naming a fixed
/// dimension become `IN` filters, every other key is a label filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectFilters {
    /// Dimension filters
    pub dimensions: Vec<(Dimension, Vec<String>)>,
    /// Label filters
    pub labels: Vec<LabelFilter>,
}

impl ObjectFilters {
    /// Split a request filter map
    pub fn split(filters: &BTreeMap<String, Vec<String>>) -> Self {
        let mut out = Self::default();
        for (key, values) in filters {
            match key.parse::<Dimension>() {
                Ok(dim) => out.dimensions.push((dim, values.clone())),
                Err(_) => out.labels.push(LabelFilter {
                    key: key.clone(),
                    values: values.clone(),
                }),
            }
        }
        out
    }

    /// Copy without the filter on `dim`
    pub fn without(&self, dim: Dimension) -> Self {
        Self {
            dimensions: self
                .dimensions
                .iter()
                .filter(|(d, _)| *d != dim)
                .cloned()
                .collect(),
            labels: self.labels.clone(),
        }
    }

    /// WHERE fragments for these filters
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut preds: Vec<Predicate> = self
            .dimensions
            .iter()
            .map(|(dim, values)| Predicate::In(*dim, values.clone()))
            .collect();
        preds.push(Predicate::Labels(self.labels.clone()));
        preds
    }
}

/// Time window, object filters and row-visibility predicate of a read
pub(crate) fn scope(range: &TimeRange, filters: &ObjectFilters, selector: &Selector) -> Vec<Predicate> {
    let mut preds = vec![Predicate::PeriodBetween(*range)];
    preds.extend(filters.predicates());
    preds.extend(row_filter(selector));
    preds
}

/// Row-visibility predicate, if the selector restricts anything
pub(crate) fn row_filter(selector: &Selector) -> Option<Predicate> {
    selector.to_sql().map(Predicate::RowFilter)
}

/// Parse a group-by name against the groupable enumeration
pub(crate) fn parse_group(group: &str) -> QueryResult<Dimension> {
    group
        .parse::<Dimension>()
        .ok()
        .filter(|d| GROUP_BY_DIMENSIONS.contains(d))
        .ok_or_else(|| QueryError::validation(format!("unknown group dimension: {}", group)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{BoundQuery, InsertTransaction, RecordingStore};
    use async_trait::async_trait;

    #[test]
    fn test_split_filters() {
        let mut map = BTreeMap::new();
        map.insert("service_name".to_string(), vec!["db1".to_string()]);
        map.insert("team".to_string(), vec!["core".to_string()]);
        let filters = ObjectFilters::split(&map);

        assert_eq!(
            filters.dimensions,
            vec![(Dimension::ServiceName, vec!["db1".to_string()])]
        );
        assert_eq!(filters.labels[0].key, "team");
        assert!(filters.without(Dimension::ServiceName).dimensions.is_empty());
    }

    #[test]
    fn test_parse_group() {
        assert_eq!(parse_group("queryid").unwrap(), Dimension::QueryId);
        let err = parse_group("node_name").unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Validation);
        assert!(err.message.contains("unknown group dimension: node_name"));
    }

    struct SlowStore;

    #[async_trait]
    impl AnalyticsStore for SlowStore {
        async fn begin(&self) -> Result<Box<dyn InsertTransaction>, StoreError> {
            RecordingStore::new().begin().await
        }

        async fn query(&self, _query: &BoundQuery) -> Result<QueryOutput, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(QueryOutput::default())
        }

        async fn execute(&self, _query: &BoundQuery) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_timeout() {
        let engine = QueryEngine::new(Arc::new(SlowStore)).with_timeout(Duration::from_secs(1));
        let q = SelectQuery::from_table("metrics").project_bare(builder::Expr::col("queryid"));
        let err = engine
            .instrument("GetReport", engine.fetch(&q))
            .await
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::Timeout);
        assert_eq!(err.operation, Some("GetReport"));
    }
}
