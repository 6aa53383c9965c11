//! End-to-End Report Integration Tests
//!
//! Drives the query engine against a scripted store and checks the shaped
//! responses, the SQL that reached the store and how the row-visibility
//! header flows into every query.
//!
//! # Test Coverage
//!
//! 1. **GetReport** - Total row, per-row stats, shares of the total, sparklines
//! 2. **Row visibility** - Header decoded and applied to every query
//! 3. **GetMetrics** - Object metrics with shares of the total
//! 4. **Error paths** - Store failures and bad headers

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qan_analytics::error::StoreError;
use qan_analytics::query::{MetricsRequest, QueryEngine, QueryErrorKind, ReportRequest};
use qan_analytics::selector::Selector;
use qan_analytics::store::{QueryOutput, RecordingStore, Row};
use serde_json::json;
use std::sync::Arc;

// =============================================================================
// Test Helpers
// =============================================================================

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("row must be an object")
}

/// One query id with two executions and 10 seconds of query time
fn report_row() -> Row {
    row(json!({
        "dimension": "Q1",
        "fingerprint": "SELECT * FROM t WHERE id = ?",
        "num_queries": 2,
        "m_query_time_sum": 10.0,
        "m_query_time_cnt": 2,
        "m_query_time_min": 1.0,
        "m_query_time_max": 9.0,
        "m_query_time_p99": 9.0,
        "m_query_time_avg": 5.0,
        "total_rows": "1"
    }))
}

/// Store answering the report query with `report_row` and every sparkline
/// query with a single point
fn report_store() -> RecordingStore {
    let store = RecordingStore::new();
    store.respond_with(|query| {
        if query.sql().contains("WITH TOTALS") {
            Ok(QueryOutput::with_totals(vec![report_row()], report_row()))
        } else {
            Ok(QueryOutput::rows(vec![row(json!({
                "point": 0,
                "time_frame": 60,
                "load": 0.5
            }))]))
        }
    });
    store
}

fn report_request() -> ReportRequest {
    ReportRequest {
        period_start_from: Some(0),
        period_start_to: Some(60),
        group_by: "queryid".to_string(),
        columns: vec!["query_time".to_string()],
        order_by: "-load".to_string(),
        ..Default::default()
    }
}

// =============================================================================
// GetReport
// =============================================================================

#[tokio::test]
async fn test_report_end_to_end() {
    let store = report_store();
    let engine = QueryEngine::new(Arc::new(store.clone()));

    let report = engine
        .get_report(&report_request(), &Selector::unrestricted())
        .await
        .unwrap();

    assert_eq!(report.total_rows, 1);
    assert_eq!(report.rows.len(), 2);

    let total = &report.rows[0];
    assert_eq!(total.rank, 0);
    assert_eq!(total.fingerprint, "TOTAL");
    assert!(total.dimension.is_empty());

    let q1 = &report.rows[1];
    assert_eq!(q1.rank, 1);
    assert_eq!(q1.dimension, "Q1");
    assert_eq!(q1.num_queries, 2);
    assert!((q1.load - 10.0 / 60.0).abs() < 1e-9);
    assert!((q1.qps - 2.0 / 60.0).abs() < 1e-9);

    let query_time = &q1.metrics["query_time"];
    assert_eq!(query_time.sum, 10.0);
    assert_eq!(query_time.avg, 5.0);
    assert_eq!(query_time.min, 1.0);
    assert_eq!(query_time.max, 9.0);
    assert!((query_time.percent_of_total - 1.0).abs() < 1e-9);

    // One-minute window: a single sparkline point per row
    for row in &report.rows {
        assert_eq!(row.sparkline.len(), 1);
        assert_eq!(row.sparkline[0].value("load"), 0.5);
    }

    // Report query plus one sparkline query per row
    let queries = store.queries();
    assert_eq!(queries.len(), 3);
    assert!(queries[0].sql().contains("GROUP BY queryid WITH TOTALS"));
    assert!(queries[0].sql().contains("ORDER BY m_query_time_sum DESC"));
}

fn group_row(id: &str, num_queries: u64, query_time: f64, max: f64) -> Row {
    row(json!({
        "dimension": id,
        "fingerprint": format!("SELECT {}", id),
        "num_queries": num_queries,
        "m_query_time_sum": query_time,
        "m_query_time_cnt": num_queries,
        "m_query_time_min": 1.0,
        "m_query_time_max": max,
        "m_query_time_p99": max,
        "total_rows": "3"
    }))
}

#[tokio::test]
async fn test_total_row_adds_up_the_groups() {
    let store = RecordingStore::new();
    store.respond_with(|query| {
        if query.sql().contains("WITH TOTALS") {
            Ok(QueryOutput::with_totals(
                vec![
                    group_row("Q1", 2, 10.0, 9.0),
                    group_row("Q2", 3, 30.0, 20.0),
                    group_row("Q3", 5, 60.0, 15.0),
                ],
                group_row("", 10, 100.0, 20.0),
            ))
        } else {
            Ok(QueryOutput::rows(Vec::new()))
        }
    });
    let engine = QueryEngine::new(Arc::new(store));

    let report = engine
        .get_report(&report_request(), &Selector::unrestricted())
        .await
        .unwrap();

    assert_eq!(report.total_rows, 3);
    assert_eq!(report.rows.len(), 4);
    let (total, groups) = report.rows.split_first().unwrap();

    let num_queries: u64 = groups.iter().map(|r| r.num_queries).sum();
    assert_eq!(total.num_queries, num_queries);
    assert_eq!(total.num_queries, 10);

    let query_time: f64 = groups.iter().map(|r| r.metrics["query_time"].sum).sum();
    assert!((total.metrics["query_time"].sum - query_time).abs() < 1e-9);
    let load: f64 = groups.iter().map(|r| r.load).sum();
    assert!((total.load - load).abs() < 1e-9);

    for column in ["query_time", "num_queries"] {
        let shares: f64 = groups
            .iter()
            .map(|r| r.metrics[column].percent_of_total)
            .sum();
        assert!((shares - 1.0).abs() < 1e-9, "{} shares add up to {}", column, shares);
        assert!((total.metrics[column].percent_of_total - 1.0).abs() < 1e-9);
    }

    let ranks: Vec<u32> = report.rows.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_report_applies_row_filter_everywhere() {
    let store = report_store();
    let engine = QueryEngine::new(Arc::new(store.clone()));

    let header = STANDARD.encode(r#"["{service_name=\"db1\", environment=\"prod\"}"]"#);
    let selector = Selector::from_header(Some(&header)).unwrap();

    engine.get_report(&report_request(), &selector).await.unwrap();

    let queries = store.queries();
    assert!(!queries.is_empty());
    for query in &queries {
        assert!(
            query
                .sql()
                .contains("(service_name = 'db1' AND environment = 'prod')"),
            "row filter missing in {}",
            query.sql()
        );
    }
}

#[tokio::test]
async fn test_report_rejects_unknown_group() {
    let engine = QueryEngine::new(Arc::new(RecordingStore::new()));
    let mut req = report_request();
    req.group_by = "color".to_string();

    let err = engine
        .get_report(&req, &Selector::unrestricted())
        .await
        .unwrap_err();
    assert_eq!(err.kind, QueryErrorKind::Validation);
    assert_eq!(err.operation, Some("GetReport"));
}

#[tokio::test]
async fn test_store_failure_surfaces_as_storage_error() {
    let store = RecordingStore::new();
    store.respond_with(|_| Err(StoreError::Query("connection reset".to_string())));
    let engine = QueryEngine::new(Arc::new(store));

    let err = engine
        .get_report(&report_request(), &Selector::unrestricted())
        .await
        .unwrap_err();
    assert_eq!(err.kind, QueryErrorKind::Storage);
}

// =============================================================================
// GetMetrics
// =============================================================================

#[tokio::test]
async fn test_metrics_totals_request() {
    let store = RecordingStore::new();
    store.respond_with(|_| {
        Ok(QueryOutput::rows(vec![row(json!({
            "num_queries": 4,
            "m_query_time_sum": 8.0,
            "m_query_time_cnt": 4
        }))]))
    });
    let engine = QueryEngine::new(Arc::new(store.clone()));

    let req = MetricsRequest {
        period_start_from: Some(0),
        period_start_to: Some(60),
        totals: true,
        ..Default::default()
    };
    let resp = engine
        .get_metrics(&req, &Selector::unrestricted())
        .await
        .unwrap();

    assert!(resp.metrics.is_empty());
    assert!(!resp.totals.is_empty());
    // Totals, sparkline and metadata; no fingerprint lookup without an object
    assert_eq!(store.queries().len(), 3);
}

// =============================================================================
// Header handling
// =============================================================================

#[test]
fn test_bad_header_never_becomes_unrestricted() {
    for header in ["%%%", "bm90IGpzb24=", "WyJzZXJ2aWNlX25hbWU9ZGIxIl0="] {
        assert!(
            Selector::from_header(Some(header)).is_err(),
            "header {} was accepted",
            header
        );
    }
}
