//! Filter discovery: SelectFilters and GetLabels
//!
//! SelectFilters weighs every value of every filterable dimension by the
//! chosen main metric. Each dimension is queried with its own selection
//! removed so that sibling values stay pickable, and a zero-weight branch
//! keeps values that the other filters exclude. Label keys and values come
//! from one array-join query over the `labels` columns.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::builder::{Direction, Expr, Predicate, SelectQuery, Source};
use super::{parse_group, row_filter, scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::columns::{self, Dimension, Facet, MetricClass, COUNT_ALIAS, FILTER_DIMENSIONS};
use crate::selector::Selector;
use crate::store::{Param, QueryOutput, RowExt, METRICS_TABLE};
use crate::types::TimeRange;

/// Main metric when the request names none
pub const DEFAULT_MAIN_METRIC: &str = "m_query_time_sum";

// ============================================================================
// Types
// ============================================================================

/// SelectFilters request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Metric the values are weighted by
    #[serde(default)]
    pub main_metric_name: String,
    /// Current dimension and label selections
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
}

/// One pickable value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterValue {
    pub value: String,
    /// Share of the main metric, 0..=1
    pub main_metric_percent: f64,
    /// Main metric per second of the window
    pub main_metric_per_sec: f64,
}

/// SelectFilters response: dimension or label key to its values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FiltersResponse {
    pub labels: BTreeMap<String, Vec<FilterValue>>,
}

/// GetLabels request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelsRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Value of the group dimension, empty for every object
    #[serde(default)]
    pub filter_by: String,
    /// Group dimension, required with `filter_by`
    #[serde(default)]
    pub group_by: String,
}

/// GetLabels response: sorted distinct values per dimension and label key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelsResponse {
    pub labels: BTreeMap<String, Vec<String>>,
}

// ============================================================================
// SelectFilters
// ============================================================================

/// Stored column the main metric is summed from
fn main_metric_column(name: &str) -> QueryResult<String> {
    let name = if name.is_empty() { "load" } else { name };
    if name == "load" {
        return Ok(DEFAULT_MAIN_METRIC.to_string());
    }
    if name == COUNT_ALIAS {
        return Ok("num_queries".to_string());
    }
    match columns::classify(name) {
        Some(MetricClass::Special) => Ok(name.to_string()),
        Some(_) => Ok(columns::facet_column(name, Facet::Sum)),
        None => Err(QueryError::validation(format!(
            "unknown main metric: {}",
            name
        ))),
    }
}

/// Weighted values of one dimension
fn dimension_query(
    dim: Dimension,
    main_column: &str,
    range: &TimeRange,
    filters: &ObjectFilters,
    selector: &Selector,
) -> SelectQuery {
    let branch = |weight: Expr, predicates: Vec<Predicate>| {
        SelectQuery::from_table(METRICS_TABLE)
            .project(Expr::param(Param::Str(dim.column().to_string())), "key")
            .project(Expr::col(dim.column()), "value")
            .project(weight, "main_metric_sum")
            .filter_all(predicates)
            .group_by(Expr::col(dim.column()))
    };

    let weighted = branch(
        Expr::sum(Expr::col(main_column)),
        scope(range, &filters.without(dim), selector),
    );
    let mut unweighted_preds = vec![Predicate::PeriodBetween(*range)];
    unweighted_preds.extend(row_filter(selector));
    let unweighted = branch(Expr::Keyword("0"), unweighted_preds);

    SelectQuery::from_source(Source::UnionAll(vec![weighted, unweighted]))
        .project_bare(Expr::col("key"))
        .project_bare(Expr::col("value"))
        .project(Expr::sum(Expr::col("main_metric_sum")), "main_metric_sum")
        .group_by(Expr::col("key"))
        .group_by(Expr::col("value"))
        .with_totals()
        .order_by(Expr::col("main_metric_sum"), Direction::Desc)
        .order_by(Expr::col("value"), Direction::Asc)
}

/// Weighted label pairs; label selections are not applied so that every
/// key keeps its alternatives
fn label_query(
    main_column: &str,
    range: &TimeRange,
    filters: &ObjectFilters,
    selector: &Selector,
) -> SelectQuery {
    let dimensions_only = ObjectFilters {
        dimensions: filters.dimensions.clone(),
        labels: Vec::new(),
    };
    SelectQuery::from_table(METRICS_TABLE)
        .project(Expr::col("labels.key"), "key")
        .project(Expr::col("labels.value"), "value")
        .project(Expr::sum(Expr::col(main_column)), "main_metric_sum")
        .left_array_join("labels")
        .filter_all(scope(range, &dimensions_only, selector))
        .group_by(Expr::col("key"))
        .group_by(Expr::col("value"))
        .with_totals()
        .order_by(Expr::col("main_metric_sum"), Direction::Desc)
        .order_by(Expr::col("value"), Direction::Asc)
}

/// Main metric of the `WITH TOTALS` row, zero when there is none
fn totals_of(output: &QueryOutput) -> f64 {
    output
        .totals
        .as_ref()
        .map(|t| t.f64_or_zero("main_metric_sum"))
        .unwrap_or(0.0)
}

/// Turn `(key, value, main_metric_sum)` rows into weighted values
///
/// The share is taken against `total`; when that is zero the values of
/// each key are weighed against each other.
fn weigh(output: &QueryOutput, total: f64, duration: f64, into: &mut BTreeMap<String, Vec<FilterValue>>) {
    let mut grouped: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for row in &output.rows {
        let key = row.string("key");
        if key.is_empty() {
            continue;
        }
        grouped
            .entry(key)
            .or_default()
            .push((row.string("value"), row.f64_or_zero("main_metric_sum")));
    }

    for (key, values) in grouped {
        let denominator = if total > 0.0 {
            total
        } else {
            values.iter().map(|(_, sum)| sum).sum()
        };
        let entry = into.entry(key).or_default();
        entry.extend(values.into_iter().map(|(value, sum)| FilterValue {
            value,
            main_metric_per_sec: sum / duration,
            main_metric_percent: if denominator > 0.0 { sum / denominator } else { 0.0 },
        }));
    }
}

impl QueryEngine {
    /// SelectFilters
    pub async fn select_filters(
        &self,
        req: &FiltersRequest,
        selector: &Selector,
    ) -> QueryResult<FiltersResponse> {
        self.instrument("SelectFilters", async {
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;
            let duration = range.duration_secs() as f64;
            let main_column = main_metric_column(&req.main_metric_name)?;
            let filters = ObjectFilters::split(&req.labels);

            let dimension_queries: Vec<SelectQuery> = FILTER_DIMENSIONS
                .iter()
                .map(|dim| dimension_query(*dim, &main_column, &range, &filters, selector))
                .collect();
            let labels = label_query(&main_column, &range, &filters, selector);

            let (dimension_outputs, label_output) = tokio::try_join!(
                try_join_all(dimension_queries.iter().map(|q| self.fetch(q))),
                self.fetch(&labels),
            )?;

            // Each query is weighed against its own WITH TOTALS row
            let mut response = FiltersResponse::default();
            for output in dimension_outputs.iter().chain(std::iter::once(&label_output)) {
                weigh(output, totals_of(output), duration, &mut response.labels);
            }

            Ok(response)
        })
        .await
    }

    /// GetFilteredMetricsNames, the same listing as SelectFilters
    pub async fn get_filtered_metrics_names(
        &self,
        req: &FiltersRequest,
        selector: &Selector,
    ) -> QueryResult<FiltersResponse> {
        self.select_filters(req, selector).await
    }

    /// GetLabels: every dimension and label value seen for an object
    pub async fn get_labels(
        &self,
        req: &LabelsRequest,
        selector: &Selector,
    ) -> QueryResult<LabelsResponse> {
        self.instrument("GetLabels", async {
            if !req.filter_by.is_empty() && req.group_by.is_empty() {
                return Err(QueryError::validation(
                    "group_by is required if filter_by is not empty",
                ));
            }
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;

            let mut preds = vec![Predicate::PeriodBetween(range)];
            if !req.filter_by.is_empty() {
                let group = parse_group(&req.group_by)?;
                preds.push(Predicate::Eq(group.column(), Param::Str(req.filter_by.clone())));
            }
            preds.extend(row_filter(selector));

            let query = object_dimensions()
                .fold(SelectQuery::from_table(METRICS_TABLE).distinct(), |q, dim| {
                    q.project_bare(Expr::col(dim.column()))
                })
                .project(Expr::col("labels.key"), "lkey")
                .project(Expr::col("labels.value"), "lvalue")
                .left_array_join("labels")
                .filter_all(preds);

            let output = self.fetch(&query).await?;

            let mut sets: BTreeMap<String, BTreeSet<String>> = object_dimensions()
                .map(|dim| (dim.column().to_string(), BTreeSet::new()))
                .collect();
            for row in &output.rows {
                for dim in object_dimensions() {
                    if let Some(values) = sets.get_mut(dim.column()) {
                        values.insert(row.string(dim.column()));
                    }
                }
                let key = row.string("lkey");
                if !key.is_empty() {
                    sets.entry(key).or_default().insert(row.string("lvalue"));
                }
            }

            Ok(LabelsResponse {
                labels: sets
                    .into_iter()
                    .map(|(k, v)| (k, v.into_iter().collect()))
                    .collect(),
            })
        })
        .await
    }
}

/// Dimensions listed by GetLabels
fn object_dimensions() -> impl Iterator<Item = Dimension> {
    Dimension::ALL
        .iter()
        .copied()
        .filter(|d| !matches!(d, Dimension::QueryId | Dimension::PlanSummary))
}
