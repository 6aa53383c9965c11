//! GetHistogram: latency histogram of one query id
//!
//! Every bucket stores its histogram as an array of JSON items. The items of
//! all matching buckets are merged by range: frequencies of a repeated range
//! are summed and each range keeps the position where it was first seen.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::builder::{Direction, Expr, Predicate, SelectQuery};
use super::{scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::selector::Selector;
use crate::store::{Param, RowExt, METRICS_TABLE};
use crate::types::{HistogramItem, TimeRange};

/// GetHistogram request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Dimension and label filters
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Query id, required
    #[serde(default)]
    pub queryid: String,
}

/// GetHistogram response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramResponse {
    pub histogram_items: Vec<HistogramItem>,
}

/// Merge `item` into `histogram` by range
pub fn merge_item(histogram: &mut Vec<HistogramItem>, item: HistogramItem) {
    match histogram.iter_mut().find(|h| h.range == item.range) {
        Some(existing) => existing.frequency += item.frequency,
        None => histogram.push(item),
    }
}

impl QueryEngine {
    /// GetHistogram
    pub async fn get_histogram(
        &self,
        req: &HistogramRequest,
        selector: &Selector,
    ) -> QueryResult<HistogramResponse> {
        self.instrument("GetHistogram", async {
            if req.queryid.is_empty() {
                return Err(QueryError::validation("queryid is required"));
            }
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;

            let mut preds = scope(&range, &ObjectFilters::split(&req.labels), selector);
            preds.push(Predicate::Eq("queryid", Param::Str(req.queryid.clone())));
            let query = SelectQuery::from_table(METRICS_TABLE)
                .project_bare(Expr::col("histogram_items"))
                .filter_all(preds)
                .order_by(Expr::col("period_start"), Direction::Desc);

            let output = self.fetch(&query).await?;

            let mut histogram = Vec::new();
            for row in &output.rows {
                for raw in row.string_list("histogram_items") {
                    let item: HistogramItem = serde_json::from_str(&raw).map_err(|e| {
                        QueryError::decode(format!("failed to unmarshal histogram item {}", raw))
                            .with_source(e)
                    })?;
                    merge_item(&mut histogram, item);
                }
            }

            Ok(HistogramResponse {
                histogram_items: histogram,
            })
        })
        .await
    }
}
