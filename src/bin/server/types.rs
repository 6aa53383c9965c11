//! Request and Response Types for the QAN HTTP Server
//!
//! Operations whose request maps one-to-one onto a query engine type use
//! that type directly; the lookups taking plain arguments get a small
//! body type here.

use serde::{Deserialize, Serialize};

// =============================================================================
// Lookup Request Types
// =============================================================================

/// Body of `/v1/qan/plan`
#[derive(Debug, Deserialize)]
pub struct QueryPlanRequest {
    pub queryid: String,
}

/// Body of `/v1/qan/exists`
#[derive(Debug, Deserialize)]
pub struct QueryExistsRequest {
    pub serviceid: String,
    pub query: String,
}

/// Body of `/v1/qan/schema` and `/v1/qan/explain_fingerprint`
#[derive(Debug, Deserialize)]
pub struct ServiceQueryRequest {
    pub serviceid: String,
    pub queryid: String,
}

/// Body of `/v1/qan/fingerprint`
#[derive(Debug, Deserialize)]
pub struct FingerprintRequest {
    pub queryid: String,
}

// =============================================================================
// Response Types
// =============================================================================

/// Collect response
#[derive(Debug, Serialize)]
pub struct CollectResponse {
    /// Buckets accepted into the queue
    pub accepted: usize,
}

/// `/v1/qan/exists` response
#[derive(Debug, Serialize)]
pub struct QueryExistsResponse {
    pub exists: bool,
}

/// `/v1/qan/fingerprint` response
#[derive(Debug, Serialize)]
pub struct FingerprintResponse {
    pub fingerprint: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Collect requests waiting in the ingestion queue
    pub queue_len: usize,
}

/// Error body returned with every non-2xx status
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable code
    pub code: &'static str,
}
