//! GetReport: ranked, grouped report with a grand-total row
//!
//! The requested columns decide the aggregate fragments:
//!
//! - common metrics: `SUM(cnt)`, `SUM(sum)`, `MIN(min)`, `MAX(max)`,
//!   `AVG(p99)` and the average per query
//! - counter metrics: `SUM(cnt)`, `SUM(sum)` and the average per query
//! - special metrics: computed from `num_queries` and `m_query_time_sum`,
//!   which every report selects
//!
//! Row 0 of the result is the `WITH TOTALS` row. Rates are always taken
//! over the whole requested window.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::builder::{Direction, Expr, Predicate, SelectQuery};
use super::sparkline::{sparkline_column, SparklinePlan, SparklinePoint};
use super::{parse_group, scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::columns::{self, Dimension, Facet, MetricClass, COUNT_ALIAS};
use crate::selector::Selector;
use crate::store::{Param, Row, RowExt, METRICS_TABLE};
use crate::types::TimeRange;

/// Page size when the request leaves it at zero
pub const DEFAULT_LIMIT: u32 = 10;

/// Fingerprint shown on the grand-total row
pub const TOTAL_FINGERPRINT: &str = "TOTAL";

// ============================================================================
// Request and response
// ============================================================================

/// GetReport request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Group dimension
    #[serde(default)]
    pub group_by: String,
    /// Metric columns; `count` is accepted for `num_queries`
    #[serde(default)]
    pub columns: Vec<String>,
    /// Order column, `-` prefix for descending
    #[serde(default)]
    pub order_by: String,
    /// Case-insensitive substring search on the group value
    #[serde(default)]
    pub search: String,
    /// Rows to skip
    #[serde(default)]
    pub offset: u32,
    /// Rows to return, zero for the default
    #[serde(default)]
    pub limit: u32,
    /// Dimension and label filters
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Metric charted in each row's sparkline; defaults to the first column
    #[serde(default)]
    pub main_metric: String,
}

/// Statistics of one metric in one row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stat {
    /// Sum per second of the window
    pub rate: f64,
    /// Number of samples carrying the metric
    pub cnt: f64,
    /// Sum
    pub sum: f64,
    /// Minimum
    pub min: f64,
    /// Maximum
    pub max: f64,
    /// Sum per query
    pub avg: f64,
    /// Average of per-bucket p99
    pub p99: f64,
    /// Sum per second of the window
    pub sum_per_sec: f64,
    /// Share of the grand total sum
    pub percent_of_total: f64,
}

/// One report row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    /// Position in the full ranking
    pub rank: u32,
    /// Group value, empty on the total row
    pub dimension: String,
    /// Query fingerprint when grouping by query id
    pub fingerprint: String,
    /// Queries in the group
    pub num_queries: u64,
    /// Queries per second
    pub qps: f64,
    /// Query time per second
    pub load: f64,
    /// Stats by requested column
    pub metrics: BTreeMap<String, Stat>,
    /// Main metric over the window
    pub sparkline: Vec<SparklinePoint>,
}

/// GetReport response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Distinct groups matching the filters
    pub total_rows: u64,
    /// Offset as requested
    pub offset: u32,
    /// Limit as requested
    pub limit: u32,
    /// Total row followed by one row per group
    pub rows: Vec<ReportRow>,
}

// ============================================================================
// Column planning
// ============================================================================

/// Validated column selection and ordering of a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnPlan {
    /// Requested columns after alias mapping, in request order
    pub columns: Vec<String>,
    /// Deduplicated columns
    pub unique: Vec<String>,
    /// Sparkline column
    pub main_metric: String,
    /// Result alias to sort on
    pub order_alias: String,
    /// Sort direction
    pub direction: Direction,
}

fn normalize(column: &str) -> &str {
    if column == COUNT_ALIAS {
        "num_queries"
    } else {
        column
    }
}

impl ColumnPlan {
    pub(crate) fn new(req: &ReportRequest) -> QueryResult<Self> {
        let (bare_order, direction) = match req.order_by.strip_prefix('-') {
            Some(rest) => (rest, Direction::Desc),
            None => (req.order_by.as_str(), Direction::Asc),
        };

        let mut selected: Vec<String> = Vec::new();
        match bare_order {
            "load" => selected.extend(["load", "num_queries", "query_time"].map(String::from)),
            COUNT_ALIAS => selected.extend(["load", "num_queries"].map(String::from)),
            _ => {}
        }
        selected.extend(req.columns.iter().map(|c| normalize(c).to_string()));

        if selected.is_empty() {
            return Err(QueryError::validation("at least one column is required"));
        }
        if let Some(bad) = selected.iter().find(|c| columns::classify(c).is_none()) {
            return Err(QueryError::validation(format!("unknown metric column: {}", bad)));
        }

        let main_metric = if req.main_metric.is_empty() {
            selected[0].clone()
        } else {
            let main = normalize(&req.main_metric).to_string();
            if columns::classify(&main).is_none() {
                return Err(QueryError::validation(format!("unknown main metric: {}", main)));
            }
            main
        };

        let mut unique: Vec<String> = Vec::with_capacity(selected.len());
        for c in &selected {
            if !unique.contains(c) {
                unique.push(c.clone());
            }
        }

        let (order_alias, order_column) = match resolve_order(bare_order) {
            Some(resolved) => resolved,
            None => resolve_order(&unique[0])
                .map(|(alias, _)| (alias, unique[0].clone()))
                .unwrap_or_else(|| (unique[0].clone(), unique[0].clone())),
        };
        if !unique.contains(&order_column) {
            return Err(QueryError::validation(format!(
                "order column '{}' not in selected columns: [{}]",
                order_column,
                unique.join(", ")
            )));
        }

        Ok(Self {
            columns: selected,
            unique,
            main_metric,
            order_alias,
            direction,
        })
    }
}

/// Sort alias and the column that must be selected for it
fn resolve_order(order: &str) -> Option<(String, String)> {
    match order {
        COUNT_ALIAS => Some(("num_queries".to_string(), "num_queries".to_string())),
        "load" => Some(("m_query_time_sum".to_string(), "query_time".to_string())),
        _ => match columns::classify(order)? {
            MetricClass::Common if columns::is_time_metric(order) => {
                Some((format!("m_{}_avg", order), order.to_string()))
            }
            MetricClass::Common | MetricClass::Counter => {
                Some((columns::facet_column(order, Facet::Sum), order.to_string()))
            }
            MetricClass::Special => Some((order.to_string(), order.to_string())),
        },
    }
}

// ============================================================================
// SQL
// ============================================================================

/// Aliased projections, first definition of an alias wins
#[derive(Default)]
struct Projections(Vec<(Expr, String)>);

impl Projections {
    fn push(&mut self, alias: impl Into<String>, expr: Expr) {
        let alias = alias.into();
        if !self.0.iter().any(|(_, a)| *a == alias) {
            self.0.push((expr, alias));
        }
    }
}

fn facet_sum(metric: &str, facet: Facet, func: &'static str) -> (String, Expr) {
    let column = columns::facet_column(metric, facet);
    (column.clone(), Expr::func(func, vec![Expr::col(column)]))
}

pub(crate) fn report_query(
    req: &ReportRequest,
    plan: &ColumnPlan,
    group: Dimension,
    predicates: Vec<Predicate>,
    limit: u32,
) -> SelectQuery {
    let mut p = Projections::default();
    p.push("dimension", Expr::col(group.column()));
    p.push(
        "fingerprint",
        if group == Dimension::QueryId {
            Expr::func("any", vec![Expr::col("fingerprint")])
        } else {
            Expr::Keyword("''")
        },
    );
    p.push("num_queries", Expr::sum(Expr::col("num_queries")));
    p.push("m_query_time_sum", Expr::sum(Expr::col("m_query_time_sum")));

    for column in &plan.unique {
        let class = columns::classify(column);
        match class {
            Some(MetricClass::Common) | Some(MetricClass::Counter) => {
                let facets: &[(Facet, &'static str)] = if class == Some(MetricClass::Common) {
                    &[
                        (Facet::Cnt, "SUM"),
                        (Facet::Sum, "SUM"),
                        (Facet::Min, "MIN"),
                        (Facet::Max, "MAX"),
                        (Facet::P99, "AVG"),
                    ]
                } else {
                    &[(Facet::Cnt, "SUM"), (Facet::Sum, "SUM")]
                };
                for (facet, func) in facets {
                    let (alias, expr) = facet_sum(column, *facet, func);
                    p.push(alias, expr);
                }
                p.push(
                    format!("m_{}_avg", column),
                    Expr::col(columns::facet_column(column, Facet::Sum))
                        .div(Expr::col("num_queries")),
                );
            }
            Some(MetricClass::Special) if column != "load" && column != "num_queries" => {
                p.push(column.clone(), Expr::sum(Expr::col(column.clone())));
            }
            _ => {}
        }
    }
    p.push(
        "total_rows",
        Expr::CountDistinct(Box::new(Expr::col(group.column()))),
    );

    let mut query = SelectQuery::from_table(METRICS_TABLE)
        .project_all(p.0.into_iter().map(|(e, a)| (e, a)))
        .filter_all(predicates);

    let search = req.search.trim().to_lowercase();
    if !search.is_empty() {
        let columns = if group == Dimension::QueryId {
            vec!["queryid", "fingerprint"]
        } else {
            vec![group.column()]
        };
        query = query.filter(Predicate::Search(columns, format!("%{}%", search)));
    }

    query
        .group_by(Expr::col(group.column()))
        .with_totals()
        .order_by(Expr::col(plan.order_alias.clone()), plan.direction)
        .limit(u64::from(req.offset), u64::from(limit))
}

// ============================================================================
// Stats
// ============================================================================

/// Stats of `column` in `row`, with shares taken against `total`
pub(crate) fn make_stat(column: &str, row: &Row, total: &Row, duration: f64) -> Stat {
    let num_queries = row.f64_or_zero("num_queries");
    let share = |sum: f64, total_sum: f64| if total_sum > 0.0 { sum / total_sum } else { 0.0 };

    match column {
        "load" => {
            let load = row.f64_or_zero("m_query_time_sum") / duration;
            Stat {
                rate: load,
                sum_per_sec: load,
                ..Default::default()
            }
        }
        "num_queries" | "num_queries_with_errors" | "num_queries_with_warnings" => {
            let sum = row.f64_or_zero(column);
            Stat {
                rate: sum / duration,
                sum,
                sum_per_sec: sum / duration,
                percent_of_total: share(sum, total.f64_or_zero(column)),
                ..Default::default()
            }
        }
        _ => {
            let sum_column = columns::facet_column(column, Facet::Sum);
            let sum = row.f64_or_zero(&sum_column);
            Stat {
                rate: sum / duration,
                cnt: row.f64_or_zero(&columns::facet_column(column, Facet::Cnt)),
                sum,
                min: row.f64_or_zero(&columns::facet_column(column, Facet::Min)),
                max: row.f64_or_zero(&columns::facet_column(column, Facet::Max)),
                avg: if num_queries > 0.0 { sum / num_queries } else { 0.0 },
                p99: row.f64_or_zero(&columns::facet_column(column, Facet::P99)),
                sum_per_sec: sum / duration,
                percent_of_total: share(sum, total.f64_or_zero(&sum_column)),
            }
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

impl QueryEngine {
    /// GetReport
    pub async fn get_report(&self, req: &ReportRequest, selector: &Selector) -> QueryResult<Report> {
        self.instrument("GetReport", async {
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;
            let group = parse_group(&req.group_by)?;
            let plan = ColumnPlan::new(req)?;
            let limit = if req.limit == 0 { DEFAULT_LIMIT } else { req.limit };
            let duration = range.duration_secs() as f64;

            let filters = ObjectFilters::split(&req.labels);
            let query = report_query(req, &plan, group, scope(&range, &filters, selector), limit);
            let output = self.fetch(&query).await?;
            let total = output.totals.unwrap_or_default();

            let mut rows = Vec::with_capacity(output.rows.len() + 1);
            rows.push(build_row(req.offset, &total, &total, &plan, duration, true, group));
            for (i, row) in output.rows.iter().enumerate() {
                let rank = req.offset + i as u32 + 1;
                rows.push(build_row(rank, row, &total, &plan, duration, false, group));
            }

            let spark_plan = SparklinePlan::new(&range);
            let sparklines = try_join_all(rows.iter().enumerate().map(|(i, row)| {
                let mut preds = scope(&spark_plan.range(), &filters, selector);
                if i > 0 {
                    preds.push(Predicate::Eq(
                        group.column(),
                        Param::Str(row.dimension.clone()),
                    ));
                }
                let plan = &plan;
                let spark_plan = &spark_plan;
                async move {
                    let column = sparkline_column(&plan.main_metric)?;
                    self.sparkline(spark_plan, vec![column], preds).await
                }
            }))
            .await?;
            for (row, sparkline) in rows.iter_mut().zip(sparklines) {
                row.sparkline = sparkline;
            }

            Ok(Report {
                total_rows: total.u64_or_zero("total_rows"),
                offset: req.offset,
                limit: req.limit,
                rows,
            })
        })
        .await
    }
}

#[allow(clippy::too_many_arguments)]
fn build_row(
    rank: u32,
    row: &Row,
    total: &Row,
    plan: &ColumnPlan,
    duration: f64,
    is_total: bool,
    group: Dimension,
) -> ReportRow {
    let num_queries = row.u64_or_zero("num_queries");
    let fingerprint = if is_total && group == Dimension::QueryId {
        TOTAL_FINGERPRINT.to_string()
    } else {
        row.string("fingerprint")
    };

    ReportRow {
        rank,
        dimension: if is_total {
            String::new()
        } else {
            row.string("dimension")
        },
        fingerprint,
        num_queries,
        qps: num_queries as f64 / duration,
        load: row.f64_or_zero("m_query_time_sum") / duration,
        metrics: plan
            .columns
            .iter()
            .map(|c| (c.clone(), make_stat(c, row, total, duration)))
            .collect(),
        sparkline: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(columns: &[&str], order_by: &str) -> ReportRequest {
        ReportRequest {
            period_start_from: Some(0),
            period_start_to: Some(60),
            group_by: "queryid".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            order_by: order_by.to_string(),
            ..Default::default()
        }
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_order_by_load_prepends_columns() {
        let plan = ColumnPlan::new(&request(&["rows_sent"], "-load")).unwrap();
        assert_eq!(plan.unique, vec!["load", "num_queries", "query_time", "rows_sent"]);
        assert_eq!(plan.order_alias, "m_query_time_sum");
        assert_eq!(plan.direction, Direction::Desc);
        assert_eq!(plan.main_metric, "load");
    }

    #[test]
    fn test_order_resolution() {
        let cases = [
            ("count", "num_queries"),
            ("query_time", "m_query_time_avg"),
            ("rows_sent", "m_rows_sent_sum"),
            ("full_scan", "m_full_scan_sum"),
            ("num_queries_with_errors", "num_queries_with_errors"),
        ];
        for (order, alias) in cases {
            let req = request(
                &["query_time", "rows_sent", "full_scan", "num_queries_with_errors"],
                order,
            );
            assert_eq!(ColumnPlan::new(&req).unwrap().order_alias, alias, "{}", order);
        }
    }

    #[test]
    fn test_default_order_uses_first_column() {
        let plan = ColumnPlan::new(&request(&["lock_time", "rows_sent"], "")).unwrap();
        assert_eq!(plan.order_alias, "m_lock_time_avg");
        assert_eq!(plan.direction, Direction::Asc);
    }

    #[test]
    fn test_order_column_must_be_selected() {
        let err = ColumnPlan::new(&request(&["rows_sent"], "lock_time")).unwrap_err();
        assert_eq!(
            err.message,
            "order column 'lock_time' not in selected columns: [rows_sent]"
        );
    }

    #[test]
    fn test_unknown_and_empty_columns_rejected() {
        assert!(ColumnPlan::new(&request(&["bogus"], "")).is_err());
        assert!(ColumnPlan::new(&request(&[], "")).is_err());
    }

    #[test]
    fn test_count_alias_and_dedup() {
        let plan = ColumnPlan::new(&request(&["count", "num_queries", "load"], "")).unwrap();
        assert_eq!(plan.unique, vec!["num_queries", "load"]);
        assert_eq!(plan.columns.len(), 3);
    }

    #[test]
    fn test_report_sql_shape() {
        let req = request(&["load", "full_scan"], "-load");
        let plan = ColumnPlan::new(&req).unwrap();
        let q = report_query(
            &req,
            &plan,
            Dimension::QueryId,
            vec![Predicate::PeriodBetween(TimeRange::new(0, 60).unwrap())],
            10,
        )
        .render();
        let sql = q.sql();

        assert!(sql.starts_with("SELECT queryid AS dimension, any(fingerprint) AS fingerprint"));
        assert!(sql.contains("MIN(m_query_time_min) AS m_query_time_min"));
        assert!(sql.contains("AVG(m_query_time_p99) AS m_query_time_p99"));
        assert!(sql.contains("m_query_time_sum / num_queries AS m_query_time_avg"));
        assert!(sql.contains("SUM(m_full_scan_cnt) AS m_full_scan_cnt"));
        assert!(!sql.contains("m_full_scan_min"));
        assert!(sql.contains("count(DISTINCT queryid) AS total_rows"));
        assert!(sql.ends_with(
            "GROUP BY queryid WITH TOTALS ORDER BY m_query_time_sum DESC LIMIT ?, ?"
        ));
        assert_eq!(sql.matches("AS m_query_time_sum").count(), 1);
    }

    #[test]
    fn test_search_on_queryid_and_fingerprint() {
        let mut req = request(&["load"], "");
        req.search = "  SELECT ".to_string();
        let plan = ColumnPlan::new(&req).unwrap();
        let q = report_query(&req, &plan, Dimension::QueryId, vec![], 10).render();
        assert!(q
            .sql()
            .contains("(lowerUTF8(queryid) LIKE ? OR lowerUTF8(fingerprint) LIKE ?)"));
        assert_eq!(q.params()[0], Param::Str("%select%".to_string()));
    }

    #[test]
    fn test_make_stat() {
        let r = row(json!({
            "num_queries": 2,
            "m_query_time_sum": 10.0,
            "m_query_time_cnt": 2,
            "m_query_time_min": 1.0,
            "m_query_time_max": 9.0,
            "m_query_time_p99": 9.0
        }));
        let total = row(json!({"num_queries": 4, "m_query_time_sum": 20.0}));

        let load = make_stat("load", &r, &total, 60.0);
        assert!((load.sum_per_sec - 10.0 / 60.0).abs() < 1e-9);

        let qt = make_stat("query_time", &r, &total, 60.0);
        assert_eq!(qt.avg, 5.0);
        assert_eq!(qt.percent_of_total, 0.5);
        assert_eq!(qt.max, 9.0);

        let nq = make_stat("num_queries", &r, &total, 60.0);
        assert_eq!(nq.sum, 2.0);
        assert_eq!(nq.percent_of_total, 0.5);
    }
}
