//! HTTP Handlers for the QAN Server
//!
//! This module contains all HTTP endpoint handlers for the JSON API.
//!
//! # Row visibility
//!
//! Every read handler decodes the `X-Proxy-Filter` header into a
//! [`Selector`] before touching the engine. A header that does not decode
//! fails the request; an absent header means no restriction.

use super::types::*;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use qan_analytics::config::Config;
use qan_analytics::error::IngestionError;
use qan_analytics::ingestion::Ingester;
use qan_analytics::query::{
    ExplainFingerprint, FiltersRequest, FiltersResponse, HistogramRequest, HistogramResponse,
    LabelsRequest, LabelsResponse, MetricsRequest, MetricsResponse, QueryEngine, QueryError,
    QueryErrorKind, QueryExampleRequest, QueryExamples, QueryPlan, Report, ReportRequest,
    SchemaInfo, SparklinePoint, SparklineRequest,
};
use qan_analytics::selector::Selector;
use qan_analytics::types::CollectBatch;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Header carrying the base64 JSON list of row-visibility selectors
pub const PROXY_FILTER_HEADER: &str = "x-proxy-filter";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state
pub struct AppState {
    /// Read side
    pub engine: QueryEngine,
    /// Write side
    pub ingester: Arc<Ingester>,
    /// Loaded configuration
    pub config: Config,
}

// =============================================================================
// Errors
// =============================================================================

/// Error returned by a handler, rendered as [`ErrorResponse`]
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match err.kind {
            QueryErrorKind::Validation | QueryErrorKind::Decode => StatusCode::BAD_REQUEST,
            QueryErrorKind::NotFound => StatusCode::NOT_FOUND,
            QueryErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            QueryErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
            QueryErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "Query failed");
        } else {
            debug!(error = %err, "Query rejected");
        }
        Self {
            status,
            code: err.kind.code(),
            message: err.to_string(),
        }
    }
}

impl From<IngestionError> for ApiError {
    fn from(err: IngestionError) -> Self {
        let (status, code) = match &err {
            IngestionError::ChannelClosed => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        warn!(error = %err, "Collect rejected");
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Decode the row-visibility header
fn selector(headers: &HeaderMap) -> Result<Selector, ApiError> {
    let header = match headers.get(PROXY_FILTER_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| {
            ApiError::from(QueryError::decode("row filter header is not valid ASCII"))
        })?),
        None => None,
    };
    Selector::from_header(header).map_err(|e| ApiError::from(QueryError::from(e)))
}

// =============================================================================
// Health & Metrics Handlers
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        queue_len: state.ingester.queue_len(),
    })
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.config.monitoring.metrics_enabled {
        return (StatusCode::NOT_FOUND, "metrics disabled".to_string());
    }
    match qan_analytics::metrics::gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to gather metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e)
        },
    }
}

// =============================================================================
// Collect Handler
// =============================================================================

/// Enqueue agent buckets; returns once the request is queued
pub async fn collect(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<CollectBatch>,
) -> ApiResult<CollectResponse> {
    let accepted = state.ingester.save(batch).await?;
    Ok(Json(CollectResponse { accepted }))
}

// =============================================================================
// Report Handlers
// =============================================================================

/// GetReport
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReportRequest>,
) -> ApiResult<Report> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_report(&req, &selector).await?))
}

/// GetMetrics
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MetricsRequest>,
) -> ApiResult<MetricsResponse> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_metrics(&req, &selector).await?))
}

/// SelectSparklines
pub async fn select_sparklines(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SparklineRequest>,
) -> ApiResult<Vec<SparklinePoint>> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.select_sparklines(&req, &selector).await?))
}

/// SelectFilters
pub async fn select_filters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FiltersRequest>,
) -> ApiResult<FiltersResponse> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.select_filters(&req, &selector).await?))
}

/// GetLabels
pub async fn get_labels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<LabelsRequest>,
) -> ApiResult<LabelsResponse> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_labels(&req, &selector).await?))
}

/// GetHistogram
pub async fn get_histogram(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HistogramRequest>,
) -> ApiResult<HistogramResponse> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_histogram(&req, &selector).await?))
}

// =============================================================================
// Object Detail Handlers
// =============================================================================

/// GetQueryExample
pub async fn get_query_example(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<QueryExampleRequest>,
) -> ApiResult<QueryExamples> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_query_example(&req, &selector).await?))
}

/// GetQueryPlan
pub async fn get_query_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<QueryPlanRequest>,
) -> ApiResult<QueryPlan> {
    let selector = selector(&headers)?;
    Ok(Json(state.engine.get_query_plan(&req.queryid, &selector).await?))
}

/// QueryExists
pub async fn query_exists(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<QueryExistsRequest>,
) -> ApiResult<QueryExistsResponse> {
    let selector = selector(&headers)?;
    let exists = state
        .engine
        .query_exists(&req.serviceid, &req.query, &selector)
        .await?;
    Ok(Json(QueryExistsResponse { exists }))
}

/// SchemaByQueryID
pub async fn schema_by_queryid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ServiceQueryRequest>,
) -> ApiResult<SchemaInfo> {
    let selector = selector(&headers)?;
    Ok(Json(
        state
            .engine
            .schema_by_queryid(&req.serviceid, &req.queryid, &selector)
            .await?,
    ))
}

/// ExplainFingerprintByQueryID
pub async fn explain_fingerprint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ServiceQueryRequest>,
) -> ApiResult<ExplainFingerprint> {
    let selector = selector(&headers)?;
    Ok(Json(
        state
            .engine
            .explain_fingerprint_by_queryid(&req.serviceid, &req.queryid, &selector)
            .await?,
    ))
}

/// GetFingerprintByQueryID
pub async fn get_fingerprint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FingerprintRequest>,
) -> ApiResult<FingerprintResponse> {
    let fingerprint = state.engine.get_fingerprint_by_queryid(&req.queryid).await?;
    Ok(Json(FingerprintResponse { fingerprint }))
}
