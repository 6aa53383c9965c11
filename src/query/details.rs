//! Object detail lookups: examples, plans, fingerprints and schema

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::builder::{Direction, Expr, Predicate, SelectQuery};
use super::{parse_group, row_filter, scope, ObjectFilters, QueryEngine, QueryError, QueryResult};
use crate::selector::Selector;
use crate::store::{Param, Row, RowExt, METRICS_TABLE};
use crate::types::{ExampleType, TimeRange};

/// Examples returned when the request leaves the limit at zero
pub const DEFAULT_EXAMPLE_LIMIT: u32 = 5;

// ============================================================================
// Types
// ============================================================================

/// GetQueryExample request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryExampleRequest {
    /// Window start, unix seconds
    pub period_start_from: Option<i64>,
    /// Window end, unix seconds
    pub period_start_to: Option<i64>,
    /// Value of the group dimension, empty for every object
    #[serde(default)]
    pub filter_by: String,
    /// Group dimension, `queryid` when empty
    #[serde(default)]
    pub group_by: String,
    /// Dimension and label filters
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Maximum number of examples
    #[serde(default)]
    pub limit: u32,
}

/// One stored example
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryExample {
    pub schema: String,
    pub tables: Vec<String>,
    pub service_id: String,
    pub service_type: String,
    pub queryid: String,
    pub explain_fingerprint: String,
    pub placeholders_count: u32,
    pub example: String,
    pub is_truncated: bool,
    pub example_type: ExampleType,
}

impl QueryExample {
    fn from_row(row: &Row) -> Self {
        Self {
            schema: row.string("schema"),
            tables: row.string_list("tables"),
            service_id: row.string("service_id"),
            service_type: row.string("service_type"),
            queryid: row.string("queryid"),
            explain_fingerprint: row.string("explain_fingerprint"),
            placeholders_count: row.u64_or_zero("placeholders_count") as u32,
            example: row.string("example"),
            is_truncated: row.u64_or_zero("is_truncated") != 0,
            example_type: ExampleType::from_code(row.u64_or_zero("example_type")),
        }
    }
}

/// GetQueryExample response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryExamples {
    pub query_examples: Vec<QueryExample>,
}

/// GetQueryPlan response, empty when the query id is unknown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub planid: String,
    pub query_plan: String,
}

/// SchemaByQueryID response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub schema: String,
}

/// ExplainFingerprintByQueryID response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainFingerprint {
    /// Text to run EXPLAIN on
    pub explain_fingerprint: String,
    /// Placeholders left in the text, zero for a real example
    pub placeholders_count: u32,
}

impl ExplainFingerprint {
    /// A stored example beats the explain fingerprint, which beats the
    /// plain fingerprint
    fn from_row(row: &Row) -> Self {
        let example = row.string("example");
        if !example.is_empty() {
            return Self {
                explain_fingerprint: example,
                placeholders_count: 0,
            };
        }

        let mut explain = row.string("explain_fingerprint");
        if explain.is_empty() {
            explain = row.string("fingerprint");
        }
        Self {
            explain_fingerprint: explain,
            placeholders_count: row.u64_or_zero("placeholders_count") as u32,
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// `SELECT <columns> FROM metrics WHERE <predicates> LIMIT 0, 1`
fn first_row_query(columns: &[&'static str], predicates: Vec<Predicate>) -> SelectQuery {
    columns
        .iter()
        .fold(SelectQuery::from_table(METRICS_TABLE), |q, c| {
            q.project_bare(Expr::col(*c))
        })
        .filter_all(predicates)
        .limit(0, 1)
}

fn require(value: &str, name: &str) -> QueryResult<()> {
    if value.is_empty() {
        return Err(QueryError::validation(format!("{} is required", name)));
    }
    Ok(())
}

/// Predicates pinning a service and query id, plus row visibility
fn service_query_scope(service_id: &str, queryid: &str, selector: &Selector) -> Vec<Predicate> {
    let mut preds = vec![
        Predicate::Eq("service_id", Param::Str(service_id.to_string())),
        Predicate::Eq("queryid", Param::Str(queryid.to_string())),
    ];
    preds.extend(row_filter(selector));
    preds
}

impl QueryEngine {
    /// Fingerprint of a query id, `None` when it was never stored
    pub(crate) async fn fetch_fingerprint(&self, queryid: &str) -> QueryResult<Option<String>> {
        if queryid.is_empty() {
            return Ok(None);
        }
        let query = first_row_query(
            &["fingerprint"],
            vec![Predicate::Eq("queryid", Param::Str(queryid.to_string()))],
        );
        let output = self.fetch(&query).await?;
        Ok(output.rows.first().map(|row| row.string("fingerprint")))
    }

    /// GetFingerprintByQueryID
    pub async fn get_fingerprint_by_queryid(&self, queryid: &str) -> QueryResult<String> {
        self.instrument("GetFingerprintByQueryID", async {
            require(queryid, "queryid")?;
            self.fetch_fingerprint(queryid)
                .await?
                .ok_or_else(|| QueryError::not_found(format!("queryid {} not found", queryid)))
        })
        .await
    }

    /// GetQueryExample: latest examples of an object
    pub async fn get_query_example(
        &self,
        req: &QueryExampleRequest,
        selector: &Selector,
    ) -> QueryResult<QueryExamples> {
        self.instrument("GetQueryExample", async {
            let range = TimeRange::from_request(req.period_start_from, req.period_start_to)?;
            let group = if req.group_by.is_empty() {
                parse_group("queryid")?
            } else {
                parse_group(&req.group_by)?
            };
            let limit = match req.limit {
                0 => DEFAULT_EXAMPLE_LIMIT,
                n => n,
            };

            let mut preds = scope(&range, &ObjectFilters::split(&req.labels), selector);
            if !req.filter_by.is_empty() {
                preds.push(Predicate::Eq(group.column(), Param::Str(req.filter_by.clone())));
            }

            let query = [
                "schema",
                "tables",
                "service_id",
                "service_type",
                "queryid",
                "explain_fingerprint",
                "placeholders_count",
                "example",
                "is_truncated",
            ]
            .iter()
            .fold(SelectQuery::from_table(METRICS_TABLE), |q, c| {
                q.project_bare(Expr::col(*c))
            })
            .project(
                Expr::func("toUInt8", vec![Expr::col("example_type")]),
                "example_type",
            )
            .filter_all(preds)
            .order_by(Expr::col("period_start"), Direction::Desc)
            .limit(0, u64::from(limit));

            let output = self.fetch(&query).await?;
            Ok(QueryExamples {
                query_examples: output.rows.iter().map(QueryExample::from_row).collect(),
            })
        })
        .await
    }

    /// GetQueryPlan
    pub async fn get_query_plan(&self, queryid: &str, selector: &Selector) -> QueryResult<QueryPlan> {
        self.instrument("GetQueryPlan", async {
            require(queryid, "queryid")?;
            let mut preds = vec![Predicate::Eq("queryid", Param::Str(queryid.to_string()))];
            preds.extend(row_filter(selector));

            let output = self
                .fetch(&first_row_query(&["planid", "query_plan"], preds))
                .await?;
            Ok(output
                .rows
                .first()
                .map(|row| QueryPlan {
                    planid: row.string("planid"),
                    query_plan: row.string("query_plan"),
                })
                .unwrap_or_default())
        })
        .await
    }

    /// QueryExists: whether a service ever reported `query` as an example
    pub async fn query_exists(
        &self,
        service_id: &str,
        query: &str,
        selector: &Selector,
    ) -> QueryResult<bool> {
        self.instrument("QueryExists", async {
            require(service_id, "service_id")?;
            let mut preds = vec![
                Predicate::Eq("service_id", Param::Str(service_id.to_string())),
                Predicate::Eq("example", Param::Str(query.to_string())),
            ];
            preds.extend(row_filter(selector));

            let output = self.fetch(&first_row_query(&["queryid"], preds)).await?;
            Ok(!output.rows.is_empty())
        })
        .await
    }

    /// SchemaByQueryID, empty when nothing matches
    pub async fn schema_by_queryid(
        &self,
        service_id: &str,
        queryid: &str,
        selector: &Selector,
    ) -> QueryResult<SchemaInfo> {
        self.instrument("SchemaByQueryID", async {
            require(service_id, "service_id")?;
            require(queryid, "queryid")?;
            let query = first_row_query(&["schema"], service_query_scope(service_id, queryid, selector));
            let output = self.fetch(&query).await?;
            Ok(SchemaInfo {
                schema: output.rows.first().map(|r| r.string("schema")).unwrap_or_default(),
            })
        })
        .await
    }

    /// ExplainFingerprintByQueryID
    pub async fn explain_fingerprint_by_queryid(
        &self,
        service_id: &str,
        queryid: &str,
        selector: &Selector,
    ) -> QueryResult<ExplainFingerprint> {
        self.instrument("ExplainFingerprintByQueryID", async {
            require(service_id, "service_id")?;
            require(queryid, "queryid")?;
            let query = first_row_query(
                &["explain_fingerprint", "fingerprint", "example", "placeholders_count"],
                service_query_scope(service_id, queryid, selector),
            );
            let output = self.fetch(&query).await?;
            output
                .rows
                .first()
                .map(ExplainFingerprint::from_row)
                .ok_or_else(|| QueryError::not_found(format!("queryid {} doesn't exist", queryid)))
        })
        .await
    }
}
