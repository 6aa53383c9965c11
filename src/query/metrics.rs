//! GetMetrics: full metric snapshot of one object
//!
//! Two aggregate queries run: one restricted to the object (`group = value`)
//! and one over the whole filtered set, which supplies the denominators of
//! `percent_of_total`. A missing object is an empty response, not an error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::builder::{Expr, Predicate, SelectQuery};
use super::report::{make_stat, Stat};
use super::sparkline::{all_sparkline_columns, SparklinePlan, SparklinePoint};
use super::{parse_group, scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::columns::{self, Dimension, Facet, MetricClass, METADATA_DIMENSIONS, SPECIAL_METRICS};
use crate::selector::Selector;
use crate::store::{Param, Row, RowExt, METRICS_TABLE};
use crate::types::TimeRange;

/// Free-text columns reported verbatim
pub const TEXT_METRICS: &[&str] = &["top_queryid", "top_query", "plan_summary"];

/// GetMetrics request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Value of the group dimension identifying the object
    #[serde(default)]
    pub filter_by: String,
    /// Group dimension
    #[serde(default)]
    pub group_by: String,
    /// Dimension and label filters
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Only compute the totals of the filtered set
    #[serde(default)]
    pub totals: bool,
}

/// Stats of every metric for one object
pub type MetricSnapshot = BTreeMap<String, Stat>;

/// GetMetrics response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsResponse {
    /// Object metrics, empty on a totals request
    pub metrics: MetricSnapshot,
    /// Metrics of the whole filtered set
    pub totals: MetricSnapshot,
    /// All per-second columns over the window
    pub sparkline: Vec<SparklinePoint>,
    /// `top_queryid`, `top_query` and `plan_summary`
    pub text_metrics: BTreeMap<String, String>,
    /// Fingerprint when the object is a query id
    pub fingerprint: String,
    /// Distinct descriptive values, comma joined, by dimension
    pub metadata: BTreeMap<String, String>,
}

impl MetricsResponse {
    /// True for the not-found result
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

/// Aggregate of every stored and special metric
fn snapshot_query(predicates: Vec<Predicate>, group: Option<Dimension>) -> SelectQuery {
    let mut query = SelectQuery::from_table(METRICS_TABLE);
    for special in SPECIAL_METRICS.iter().filter(|m| **m != "load") {
        query = query.project(Expr::sum(Expr::col(*special)), *special);
    }
    for metric in columns::COMMON_METRICS.iter().chain(columns::COUNTER_METRICS) {
        let class = columns::classify(metric).unwrap_or(MetricClass::Counter);
        for facet in Facet::for_class(class) {
            let column = columns::facet_column(metric, *facet);
            let func = match facet {
                Facet::Cnt | Facet::Sum => "SUM",
                Facet::Min => "MIN",
                Facet::Max => "MAX",
                Facet::P99 => "AVG",
            };
            query = query.project(Expr::func(func, vec![Expr::col(column.clone())]), column);
        }
    }
    for text in TEXT_METRICS {
        query = query.project(Expr::func("any", vec![Expr::col(*text)]), *text);
    }

    query = query.filter_all(predicates);
    match group {
        Some(group) => query.group_by(Expr::col(group.column())).with_totals(),
        None => query,
    }
}

/// Stats of every metric in `row`
fn make_snapshot(row: &Row, totals: &Row, duration: f64) -> MetricSnapshot {
    SPECIAL_METRICS
        .iter()
        .filter(|m| **m != "load")
        .chain(columns::COMMON_METRICS)
        .chain(columns::COUNTER_METRICS)
        .map(|m| (m.to_string(), make_stat(m, row, totals, duration)))
        .collect()
}

/// Sorted distinct values per metadata dimension, comma joined
fn collect_metadata(rows: &[Row]) -> BTreeMap<String, String> {
    METADATA_DIMENSIONS
        .iter()
        .map(|dim| {
            let values: BTreeSet<String> = rows.iter().map(|r| r.string(dim.column())).collect();
            (
                dim.column().to_string(),
                values.into_iter().collect::<Vec<_>>().join(", "),
            )
        })
        .collect()
}

impl QueryEngine {
    /// GetMetrics
    pub async fn get_metrics(
        &self,
        req: &MetricsRequest,
        selector: &Selector,
    ) -> QueryResult<MetricsResponse> {
        self.instrument("GetMetrics", async {
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;
            let duration = range.duration_secs() as f64;
            let filters = ObjectFilters::split(&req.labels);

            let object = if req.totals {
                None
            } else {
                let group = parse_group(&req.group_by)?;
                Some((group, Predicate::Eq(group.column(), Param::Str(req.filter_by.clone()))))
            };

            let object_row = match &object {
                Some((group, eq)) => {
                    let mut preds = scope(&range, &filters, selector);
                    preds.push(eq.clone());
                    let output = self.fetch(&snapshot_query(preds, Some(*group))).await?;
                    match output.rows.into_iter().next() {
                        Some(row) => Some(row),
                        None => {
                            debug!(
                                "metrics not found for filter: {} and group: {} in given time range",
                                req.filter_by, req.group_by
                            );
                            return Ok(MetricsResponse::default());
                        }
                    }
                }
                None => None,
            };

            let totals_output = self
                .fetch(&snapshot_query(scope(&range, &filters, selector), None))
                .await?;
            let totals = match totals_output.rows.into_iter().next() {
                Some(row) if row.u64_or_zero("num_queries") > 0 => row,
                _ => {
                    debug!("totals not found for group: {} in given time range", req.group_by);
                    return Ok(MetricsResponse::default());
                }
            };

            let object_preds = || {
                let mut preds = scope(&range, &filters, selector);
                preds.extend(object.as_ref().map(|(_, eq)| eq.clone()));
                preds
            };

            let spark_plan = SparklinePlan::new(&range);
            let mut spark_preds = scope(&spark_plan.range(), &filters, selector);
            spark_preds.extend(object.as_ref().map(|(_, eq)| eq.clone()));

            let fingerprint = async {
                match &object {
                    Some((Dimension::QueryId, _)) => self
                        .fetch_fingerprint(&req.filter_by)
                        .await
                        .map(Option::unwrap_or_default),
                    _ => Ok(String::new()),
                }
            };
            let metadata = async {
                let query = SelectQuery::from_table(METRICS_TABLE)
                    .distinct()
                    .project_all(
                        METADATA_DIMENSIONS
                            .iter()
                            .map(|d| (Expr::col(d.column()), d.column().to_string())),
                    )
                    .filter_all(object_preds());
                Ok::<_, QueryError>(collect_metadata(&self.fetch(&query).await?.rows))
            };

            let (sparkline, fingerprint, metadata) = tokio::try_join!(
                self.sparkline(&spark_plan, all_sparkline_columns(), spark_preds),
                fingerprint,
                metadata
            )?;

            let text_metrics = TEXT_METRICS
                .iter()
                .map(|t| {
                    let value = object_row.as_ref().map(|r| r.string(t)).unwrap_or_default();
                    (t.to_string(), value)
                })
                .collect();

            Ok(MetricsResponse {
                metrics: object_row
                    .as_ref()
                    .map(|row| make_snapshot(row, &totals, duration))
                    .unwrap_or_default(),
                totals: make_snapshot(&totals, &totals, duration),
                sparkline,
                text_metrics,
                fingerprint,
                metadata,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{QueryOutput, RecordingStore};
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn request() -> MetricsRequest {
        MetricsRequest {
            period_start_from: Some(0),
            period_start_to: Some(120),
            filter_by: "Q1".to_string(),
            group_by: "queryid".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_query_shape() {
        let q = snapshot_query(vec![], Some(Dimension::QueryId)).render();
        let sql = q.sql();
        assert!(sql.contains("SUM(num_queries_with_errors) AS num_queries_with_errors"));
        assert!(sql.contains("AVG(m_query_time_p99) AS m_query_time_p99"));
        assert!(sql.contains("SUM(m_full_scan_sum) AS m_full_scan_sum"));
        assert!(!sql.contains("m_full_scan_p99"));
        assert!(sql.contains("any(plan_summary) AS plan_summary"));
        assert!(sql.ends_with("GROUP BY queryid WITH TOTALS"));
        assert!(!snapshot_query(vec![], None).render().sql().contains("GROUP BY"));
    }

    #[test]
    fn test_collect_metadata() {
        let rows = vec![
            row(json!({"service_name": "b", "database": "x"})),
            row(json!({"service_name": "a", "database": "x"})),
        ];
        let metadata = collect_metadata(&rows);
        assert_eq!(metadata["service_name"], "a, b");
        assert_eq!(metadata["database"], "x");
        assert_eq!(metadata["node_type"], "");
    }

    #[tokio::test]
    async fn test_missing_object_is_empty() {
        let engine = QueryEngine::new(Arc::new(RecordingStore::new()));
        let resp = engine
            .get_metrics(&request(), &Selector::unrestricted())
            .await
            .unwrap();
        assert!(resp.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_percent_of_total() {
        let store = RecordingStore::new();
        store.respond_with(|q| {
            let sql = q.sql();
            let out = if sql.contains("GROUP BY queryid WITH TOTALS") {
                QueryOutput::rows(vec![row(json!({
                    "num_queries": 2, "m_query_time_sum": 10.0, "m_query_time_cnt": 2,
                    "top_query": "SELECT 1"
                }))])
            } else if sql.contains("SELECT DISTINCT") {
                QueryOutput::rows(vec![row(json!({"service_name": "db1"}))])
            } else if sql.starts_with("SELECT fingerprint") {
                QueryOutput::rows(vec![row(json!({"fingerprint": "SELECT ?"}))])
            } else if sql.contains("AS point") {
                QueryOutput::default()
            } else {
                QueryOutput::rows(vec![row(json!({
                    "num_queries": 8, "m_query_time_sum": 40.0, "m_query_time_cnt": 8
                }))])
            };
            Ok(out)
        });
        let engine = QueryEngine::new(Arc::new(store));

        let resp = engine
            .get_metrics(&request(), &Selector::unrestricted())
            .await
            .unwrap();
        let qt = &resp.metrics["query_time"];
        assert_eq!(qt.avg, 5.0);
        assert_eq!(qt.percent_of_total, 0.25);
        assert_eq!(resp.totals["num_queries"].sum, 8.0);
        assert_eq!(resp.text_metrics["top_query"], "SELECT 1");
        assert_eq!(resp.fingerprint, "SELECT ?");
        assert_eq!(resp.metadata["service_name"], "db1");
        assert_eq!(resp.sparkline.len(), 2);
    }
}
