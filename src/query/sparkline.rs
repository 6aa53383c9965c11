//! Sparkline bucketing and gap filling
//!
//! A sparkline splits the requested window into equal time frames counted
//! backwards from the (minute aligned) end of the window. Point `i` covers
//! the frame ending at `to - i * time_frame`.
//!
//! The store only returns frames that have rows; [`fill_gaps`] turns that
//! sparse result into the dense `0..points` sequence with zero placeholders.
//!
//! # Example
//!
//! ```rust
//! use qan_analytics::query::SparklinePlan;
//! use qan_analytics::types::TimeRange;
//!
//! // Four hours: 120 points of two minutes each
//! let plan = SparklinePlan::new(&TimeRange::new(0, 4 * 3600).unwrap());
//! assert_eq!(plan.points, 120);
//! assert_eq!(plan.time_frame, 120);
//! ```

use std::collections::BTreeMap;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::builder::{Expr, Predicate, SelectQuery};
use super::{parse_group, scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::columns::{self, Facet, MetricClass, SPECIAL_METRICS};
use crate::selector::Selector;
use crate::store::{Param, RowExt, METRICS_TABLE};
use crate::types::TimeRange;

/// Point count for windows of two hours and longer
pub const OPTIMAL_POINTS: u32 = 120;

/// Windows shorter than this get one point per minute
const FULL_TIME_FRAME_SECS: i64 = 2 * 60 * 60;

// ============================================================================
// Bucketing
// ============================================================================

/// Bucketing of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparklinePlan {
    /// Window start aligned down to the minute
    pub from: i64,
    /// Window end aligned down to the minute
    pub to: i64,
    /// Number of points in the dense result
    pub points: u32,
    /// Seconds covered by one point
    pub time_frame: i64,
}

impl SparklinePlan {
    /// Compute the bucketing of `range`
    ///
    /// Windows shorter than one minute have no points.
    pub fn new(range: &TimeRange) -> Self {
        let from = range.from.div_euclid(60) * 60;
        let to = range.to.div_euclid(60) * 60;
        let period = to - from;
        let minutes = period / 60;

        let mut points = if period < FULL_TIME_FRAME_SECS {
            minutes
        } else {
            i64::from(OPTIMAL_POINTS)
        };
        if points <= 0 {
            return Self {
                from,
                to,
                points: 0,
                time_frame: 0,
            };
        }

        let minutes_in_point = minutes / points;
        let remainder = minutes % points;
        points += remainder / minutes_in_point;

        Self {
            from,
            to,
            points: u32::try_from(points).unwrap_or(u32::MAX),
            time_frame: minutes_in_point * 60,
        }
    }

    /// True when the window is too short for a single point
    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Unix timestamp of point `index`
    pub fn timestamp(&self, index: u32) -> i64 {
        self.to - self.time_frame * i64::from(index)
    }

    /// Aligned window as a range
    pub fn range(&self) -> TimeRange {
        TimeRange {
            from: self.from,
            to: self.to,
        }
    }
}

// ============================================================================
// Points
// ============================================================================

/// One sparkline point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparklinePoint {
    /// Index counted back from the end of the window
    pub point: u32,
    /// RFC 3339 timestamp of the frame end
    pub timestamp: String,
    /// Seconds covered by the point
    pub time_frame: u32,
    /// Per-second values keyed by column alias; NaN when no sample carried
    /// the metric
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl SparklinePoint {
    /// Zero-valued point used where the store returned nothing
    pub fn placeholder(plan: &SparklinePlan, index: u32, columns: &[String]) -> Self {
        Self {
            point: index,
            timestamp: rfc3339(plan.timestamp(index)),
            time_frame: plan.time_frame as u32,
            values: columns.iter().map(|c| (c.clone(), 0.0)).collect(),
        }
    }

    /// Value of `column`, zero when absent
    pub fn value(&self, column: &str) -> f64 {
        self.values.get(column).copied().unwrap_or(0.0)
    }
}

fn rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Expand a sparse `index -> point` map into the dense ordered sequence
///
/// Indices outside `0..plan.points` are discarded.
pub fn fill_gaps(
    plan: &SparklinePlan,
    mut sparse: BTreeMap<u32, SparklinePoint>,
    columns: &[String],
) -> Vec<SparklinePoint> {
    (0..plan.points)
        .map(|i| {
            sparse
                .remove(&i)
                .unwrap_or_else(|| SparklinePoint::placeholder(plan, i, columns))
        })
        .collect()
}

// ============================================================================
// Query
// ============================================================================

/// Per-second value expression of one sparkline column
///
/// Returns the result alias and its expression. An empty name selects
/// `query_time`.
pub(crate) fn sparkline_column(column: &str) -> QueryResult<(String, Expr)> {
    let column = match column {
        "" => "query_time",
        columns::COUNT_ALIAS => "num_queries",
        other => other,
    };
    let time_frame = || Expr::col("time_frame");

    match columns::classify(column) {
        Some(MetricClass::Special) if column == "load" => Ok((
            "load".to_string(),
            Expr::sum(Expr::col("m_query_time_sum")).div(time_frame()),
        )),
        Some(MetricClass::Special) => Ok((
            format!("{}_per_sec", column),
            Expr::sum(Expr::col(column)).div(time_frame()),
        )),
        Some(_) => Ok((
            format!("m_{}_sum_per_sec", column),
            Expr::If(
                Box::new(
                    Expr::sum(Expr::col(columns::facet_column(column, Facet::Cnt)))
                        .eq(Expr::Keyword("0")),
                ),
                Box::new(Expr::Keyword("NaN")),
                Box::new(
                    Expr::sum(Expr::col(columns::facet_column(column, Facet::Sum)))
                        .div(time_frame()),
                ),
            ),
        )),
        None => Err(QueryError::validation(format!(
            "unknown sparkline column: {}",
            column
        ))),
    }
}

/// Every per-second column, as shown on the object details page
pub(crate) fn all_sparkline_columns() -> Vec<(String, Expr)> {
    SPECIAL_METRICS
        .iter()
        .chain(columns::COMMON_METRICS)
        .chain(columns::COUNTER_METRICS)
        .filter_map(|name| sparkline_column(name).ok())
        .collect()
}

/// Build the bucketed select for `plan`
pub(crate) fn sparkline_query(
    plan: &SparklinePlan,
    columns: Vec<(String, Expr)>,
    predicates: Vec<Predicate>,
) -> SelectQuery {
    let point = Expr::func(
        "intDivOrZero",
        vec![
            Expr::param(Param::Int(plan.to)).sub(Expr::func(
                "toUnixTimestamp",
                vec![Expr::col("period_start")],
            )),
            Expr::param(Param::Int(plan.time_frame)),
        ],
    );

    SelectQuery::from_table(METRICS_TABLE)
        .project(point, "point")
        .project(Expr::param(Param::Int(plan.time_frame)), "time_frame")
        .project_all(columns.into_iter().map(|(alias, expr)| (expr, alias)))
        .filter_all(predicates)
        .group_by(Expr::col("point"))
        .order_by(Expr::col("point"), super::builder::Direction::Asc)
}

impl QueryEngine {
    /// Run a sparkline query and gap-fill the result
    pub(crate) async fn sparkline(
        &self,
        plan: &SparklinePlan,
        columns: Vec<(String, Expr)>,
        predicates: Vec<Predicate>,
    ) -> QueryResult<Vec<SparklinePoint>> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let aliases: Vec<String> = columns.iter().map(|(alias, _)| alias.clone()).collect();
        let output = self
            .fetch(&sparkline_query(plan, columns, predicates))
            .await?;

        let sparse = output
            .rows
            .iter()
            .map(|row| {
                let index = row.u64_or_zero("point") as u32;
                let values = aliases
                    .iter()
                    .map(|alias| (alias.clone(), row.f64_or_nan(alias)))
                    .collect();
                let point = SparklinePoint {
                    point: index,
                    timestamp: rfc3339(plan.timestamp(index)),
                    time_frame: plan.time_frame as u32,
                    values,
                };
                (index, point)
            })
            .collect();

        Ok(fill_gaps(plan, sparse, &aliases))
    }

    /// SelectSparklines: dense per-second series of one column
    ///
    /// Unless `totals` is set the series is restricted to rows whose
    /// `group_by` dimension equals `filter_by`.
    pub async fn select_sparklines(
        &self,
        req: &SparklineRequest,
        selector: &Selector,
    ) -> QueryResult<Vec<SparklinePoint>> {
        self.instrument("SelectSparklines", async {
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;
            let plan = SparklinePlan::new(&range);
            let column = sparkline_column(&req.column)?;

            let filters = ObjectFilters::split(&req.labels);
            let mut preds = scope(&plan.range(), &filters, selector);
            if !req.totals {
                let group = parse_group(&req.group_by)?;
                preds.push(Predicate::Eq(group.column(), Param::Str(req.filter_by.clone())));
            }

            self.sparkline(&plan, vec![column], preds).await
        })
        .await
    }
}

/// SelectSparklines request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparklineRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Value of the group dimension to chart
    #[serde(default)]
    pub filter_by: String,
    /// Group dimension
    #[serde(default)]
    pub group_by: String,
    /// Dimension and label filters
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Metric or special column; empty means `query_time`
    #[serde(default)]
    pub column: String,
    /// Chart the whole filtered set instead of one object
    #[serde(default)]
    pub totals: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{QueryOutput, RecordingStore, Row};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn plan(from: i64, to: i64) -> SparklinePlan {
        SparklinePlan::new(&TimeRange::new(from, to).unwrap())
    }

    #[test]
    fn test_short_window_one_point_per_minute() {
        let p = plan(0, 30 * 60);
        assert_eq!(p.points, 30);
        assert_eq!(p.time_frame, 60);
    }

    #[test]
    fn test_long_window_absorbs_remainder() {
        // 250 minutes: 2 minutes per point, 10 spare minutes -> 5 more points
        let p = plan(0, 250 * 60);
        assert_eq!(p.points, 125);
        assert_eq!(p.time_frame, 120);
    }

    #[test]
    fn test_alignment_to_minutes() {
        let p = plan(61, 3599);
        assert_eq!(p.from, 60);
        assert_eq!(p.to, 3540);
        assert_eq!(p.points, 58);
    }

    #[test]
    fn test_sub_minute_window_is_empty() {
        assert!(plan(0, 59).is_empty());
        assert!(fill_gaps(&plan(0, 59), BTreeMap::new(), &[]).is_empty());
    }

    #[test]
    fn test_fill_gaps_keeps_returned_points() {
        let p = plan(0, 5 * 60);
        let columns = vec!["load".to_string()];
        let mut sparse = BTreeMap::new();
        for i in [0u32, 2] {
            let mut point = SparklinePoint::placeholder(&p, i, &columns);
            point.values.insert("load".to_string(), 1.5);
            sparse.insert(i, point);
        }

        let dense = fill_gaps(&p, sparse, &columns);
        assert_eq!(dense.len(), 5);
        for (i, point) in dense.iter().enumerate() {
            assert_eq!(point.point, i as u32);
            assert_eq!(point.time_frame, 60);
        }
        assert_eq!(dense[0].value("load"), 1.5);
        assert_eq!(dense[1].value("load"), 0.0);
        assert_eq!(dense[3].timestamp, "1970-01-01T00:02:00Z");
        assert_eq!(dense[4].timestamp, "1970-01-01T00:01:00Z");
    }

    #[test]
    fn test_sparkline_column_fragments() {
        let (alias, _) = sparkline_column("").unwrap();
        assert_eq!(alias, "m_query_time_sum_per_sec");
        let (alias, _) = sparkline_column("count").unwrap();
        assert_eq!(alias, "num_queries_per_sec");
        let (alias, _) = sparkline_column("load").unwrap();
        assert_eq!(alias, "load");
        assert!(sparkline_column("bogus").is_err());
    }

    #[test]
    fn test_sparkline_sql_shape() {
        let p = plan(0, 10 * 60);
        let q = sparkline_query(
            &p,
            vec![sparkline_column("rows_sent").unwrap()],
            vec![Predicate::PeriodBetween(p.range())],
        )
        .render();
        assert_eq!(
            q.sql(),
            "SELECT intDivOrZero(? - toUnixTimestamp(period_start), ?) AS point, ? AS time_frame, \
             if(SUM(m_rows_sent_cnt) == 0, NaN, SUM(m_rows_sent_sum) / time_frame) AS m_rows_sent_sum_per_sec \
             FROM metrics WHERE period_start >= ? AND period_start <= ? \
             GROUP BY point ORDER BY point ASC"
        );
        assert_eq!(q.params()[0], Param::Int(600));
        assert_eq!(q.params()[1], Param::Int(60));
    }

    #[tokio::test]
    async fn test_select_sparklines_gap_fill() {
        let store = RecordingStore::new();
        store.respond_with(|_| {
            let rows: Vec<Row> = vec![
                json!({"point": 0, "time_frame": 60, "load": 0.5}),
                json!({"point": 2, "time_frame": 60, "load": null}),
            ]
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect();
            Ok(QueryOutput::rows(rows))
        });
        let engine = QueryEngine::new(Arc::new(store.clone()));
        let req = SparklineRequest {
            period_start_from: Some(0),
            period_start_to: Some(300),
            filter_by: "Q1".to_string(),
            group_by: "queryid".to_string(),
            column: "load".to_string(),
            ..Default::default()
        };

        let points = engine
            .select_sparklines(&req, &Selector::unrestricted())
            .await
            .unwrap();
        assert_eq!(points.len(), 5);
        assert_eq!(points[0].value("load"), 0.5);
        assert!(points[2].value("load").is_nan());
        assert_eq!(points[4].value("load"), 0.0);

        let sql = store.queries()[0].sql().to_string();
        assert!(sql.contains("queryid = ?"));
    }

    #[tokio::test]
    async fn test_select_sparklines_rejects_unknown_group() {
        let engine = QueryEngine::new(Arc::new(RecordingStore::new()));
        let req = SparklineRequest {
            period_start_from: Some(0),
            period_start_to: Some(300),
            group_by: "nope".to_string(),
            ..Default::default()
        };
        let err = engine
            .select_sparklines(&req, &Selector::unrestricted())
            .await
            .unwrap_err();
        assert_eq!(err.operation, Some("SelectSparklines"));
    }

    proptest! {
        #[test]
        fn prop_dense_length_matches_plan(
            from in 0i64..2_000_000_000,
            len in 60i64..(30 * 24 * 3600),
            present in proptest::collection::btree_set(0u32..200, 0..20),
        ) {
            let p = plan(from, from + len);
            let columns = vec!["load".to_string()];
            let sparse = present
                .into_iter()
                .map(|i| (i, SparklinePoint::placeholder(&p, i, &columns)))
                .collect();
            let dense = fill_gaps(&p, sparse, &columns);

            prop_assert_eq!(dense.len(), p.points as usize);
            for (i, point) in dense.iter().enumerate() {
                prop_assert_eq!(point.point, i as u32);
            }
        }

        #[test]
        fn prop_frames_cover_window(from in 0i64..2_000_000_000, len in 60i64..(30 * 24 * 3600)) {
            let p = plan(from, from + len);
            let minutes = (p.to - p.from) / 60;
            prop_assert!(p.points >= 1);
            prop_assert!(p.time_frame >= 60);
            prop_assert!(i64::from(p.points) * p.time_frame / 60 <= minutes);
        }
    }
}
