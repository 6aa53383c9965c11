//! Layout of the `metrics` table
//!
//! [`MetricsRow`] is the `RowBinary` insert row and [`table_columns`] the
//! column list the DDL is rendered from. Both are spelled from the taxonomy
//! tables, and the tests below keep them aligned, so a metric added to
//! [`crate::columns`] is written and read under the same name.

use serde::Serialize;

use super::METRICS_TABLE;
use crate::columns::{self, Dimension, Facet, MetricClass};
use crate::types::MetricBucket;

macro_rules! metrics_row {
    (
        dimensions { $($dim:ident => $variant:ident),+ $(,)? }
        common { $($common:ident => [$cnt:ident, $sum:ident, $min:ident, $max:ident, $p99:ident]),+ $(,)? }
        counters { $($counter:ident => [$c_cnt:ident, $c_sum:ident]),+ $(,)? }
    ) => {
        /// One `metrics` row as written with `RowBinary`
        ///
        /// Field order is the insert column order; field types match
        /// [`table_columns`].
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Default, PartialEq, ::clickhouse::Row, Serialize)]
        pub struct MetricsRow {
            $(pub $dim: String,)+
            /// `DateTime`, unix seconds
            pub period_start: u32,
            pub period_length: u32,
            pub fingerprint: String,
            pub explain_fingerprint: String,
            pub placeholders_count: u32,
            pub tables: Vec<String>,
            pub example: String,
            pub example_type: u8,
            pub is_truncated: u8,
            pub top_query: String,
            pub query_plan: String,
            /// JSON-encoded histogram items
            pub histogram_items: Vec<String>,
            #[serde(rename = "labels.key")]
            pub labels_key: Vec<String>,
            #[serde(rename = "labels.value")]
            pub labels_value: Vec<String>,
            #[serde(rename = "warnings.code")]
            pub warnings_code: Vec<u64>,
            #[serde(rename = "warnings.count")]
            pub warnings_count: Vec<u64>,
            #[serde(rename = "errors.code")]
            pub errors_code: Vec<u64>,
            #[serde(rename = "errors.count")]
            pub errors_count: Vec<u64>,
            pub num_queries: u32,
            pub num_queries_with_errors: u32,
            pub num_queries_with_warnings: u32,
            $(
                pub $cnt: f32,
                pub $sum: f32,
                pub $min: f32,
                pub $max: f32,
                pub $p99: f32,
            )+
            $(
                pub $c_cnt: f32,
                pub $c_sum: f32,
            )+
        }

        impl MetricsRow {
            /// Row of one validated bucket
            pub fn from_bucket(bucket: &MetricBucket) -> Self {
                let mut row = Self {
                    $($dim: bucket.dimension(Dimension::$variant).to_string(),)+
                    period_start: u32::try_from(bucket.period_start).unwrap_or_default(),
                    period_length: bucket.period_length,
                    fingerprint: bucket.fingerprint.clone(),
                    explain_fingerprint: bucket.explain_fingerprint.clone(),
                    placeholders_count: bucket.placeholders_count,
                    tables: bucket.tables.clone(),
                    example: bucket.example.clone(),
                    example_type: bucket.example_type.code(),
                    is_truncated: u8::from(bucket.is_truncated),
                    top_query: bucket.top_query.clone(),
                    query_plan: bucket.query_plan.clone(),
                    histogram_items: bucket
                        .histogram_items
                        .iter()
                        .filter_map(|item| serde_json::to_string(item).ok())
                        .collect(),
                    labels_key: bucket.labels.keys().to_vec(),
                    labels_value: bucket.labels.values().to_vec(),
                    warnings_code: bucket.warnings.keys().copied().collect(),
                    warnings_count: bucket.warnings.values().copied().collect(),
                    errors_code: bucket.errors.keys().copied().collect(),
                    errors_count: bucket.errors.values().copied().collect(),
                    num_queries: bucket.num_queries,
                    num_queries_with_errors: bucket.num_queries_with_errors,
                    num_queries_with_warnings: bucket.num_queries_with_warnings,
                    ..Self::default()
                };
                $(
                    let m = bucket.metric(stringify!($common));
                    row.$cnt = m.cnt;
                    row.$sum = m.sum;
                    row.$min = m.min;
                    row.$max = m.max;
                    row.$p99 = m.p99;
                )+
                $(
                    let m = bucket.metric(stringify!($counter));
                    row.$c_cnt = m.cnt;
                    row.$c_sum = m.sum;
                )+
                row
            }
        }
    };
}

metrics_row! {
    dimensions {
        queryid => QueryId,
        service_name => ServiceName,
        database => Database,
        schema => Schema,
        username => Username,
        client_host => ClientHost,
        replication_set => ReplicationSet,
        cluster => Cluster,
        service_type => ServiceType,
        service_id => ServiceId,
        environment => Environment,
        az => Az,
        region => Region,
        node_model => NodeModel,
        node_id => NodeId,
        node_name => NodeName,
        node_type => NodeType,
        machine_id => MachineId,
        container_name => ContainerName,
        container_id => ContainerId,
        agent_id => AgentId,
        agent_type => AgentType,
        cmd_type => CmdType,
        top_queryid => TopQueryId,
        application_name => ApplicationName,
        planid => PlanId,
        plan_summary => PlanSummary,
    }
    common {
        query_time => [m_query_time_cnt, m_query_time_sum, m_query_time_min, m_query_time_max, m_query_time_p99],
        lock_time => [m_lock_time_cnt, m_lock_time_sum, m_lock_time_min, m_lock_time_max, m_lock_time_p99],
        rows_sent => [m_rows_sent_cnt, m_rows_sent_sum, m_rows_sent_min, m_rows_sent_max, m_rows_sent_p99],
        rows_examined => [m_rows_examined_cnt, m_rows_examined_sum, m_rows_examined_min, m_rows_examined_max, m_rows_examined_p99],
        rows_affected => [m_rows_affected_cnt, m_rows_affected_sum, m_rows_affected_min, m_rows_affected_max, m_rows_affected_p99],
        rows_read => [m_rows_read_cnt, m_rows_read_sum, m_rows_read_min, m_rows_read_max, m_rows_read_p99],
        merge_passes => [m_merge_passes_cnt, m_merge_passes_sum, m_merge_passes_min, m_merge_passes_max, m_merge_passes_p99],
        innodb_io_r_ops => [m_innodb_io_r_ops_cnt, m_innodb_io_r_ops_sum, m_innodb_io_r_ops_min, m_innodb_io_r_ops_max, m_innodb_io_r_ops_p99],
        innodb_io_r_bytes => [m_innodb_io_r_bytes_cnt, m_innodb_io_r_bytes_sum, m_innodb_io_r_bytes_min, m_innodb_io_r_bytes_max, m_innodb_io_r_bytes_p99],
        innodb_io_r_wait => [m_innodb_io_r_wait_cnt, m_innodb_io_r_wait_sum, m_innodb_io_r_wait_min, m_innodb_io_r_wait_max, m_innodb_io_r_wait_p99],
        innodb_rec_lock_wait => [m_innodb_rec_lock_wait_cnt, m_innodb_rec_lock_wait_sum, m_innodb_rec_lock_wait_min, m_innodb_rec_lock_wait_max, m_innodb_rec_lock_wait_p99],
        innodb_queue_wait => [m_innodb_queue_wait_cnt, m_innodb_queue_wait_sum, m_innodb_queue_wait_min, m_innodb_queue_wait_max, m_innodb_queue_wait_p99],
        innodb_pages_distinct => [m_innodb_pages_distinct_cnt, m_innodb_pages_distinct_sum, m_innodb_pages_distinct_min, m_innodb_pages_distinct_max, m_innodb_pages_distinct_p99],
        query_length => [m_query_length_cnt, m_query_length_sum, m_query_length_min, m_query_length_max, m_query_length_p99],
        bytes_sent => [m_bytes_sent_cnt, m_bytes_sent_sum, m_bytes_sent_min, m_bytes_sent_max, m_bytes_sent_p99],
        tmp_tables => [m_tmp_tables_cnt, m_tmp_tables_sum, m_tmp_tables_min, m_tmp_tables_max, m_tmp_tables_p99],
        tmp_disk_tables => [m_tmp_disk_tables_cnt, m_tmp_disk_tables_sum, m_tmp_disk_tables_min, m_tmp_disk_tables_max, m_tmp_disk_tables_p99],
        tmp_table_sizes => [m_tmp_table_sizes_cnt, m_tmp_table_sizes_sum, m_tmp_table_sizes_min, m_tmp_table_sizes_max, m_tmp_table_sizes_p99],
        docs_returned => [m_docs_returned_cnt, m_docs_returned_sum, m_docs_returned_min, m_docs_returned_max, m_docs_returned_p99],
        response_length => [m_response_length_cnt, m_response_length_sum, m_response_length_min, m_response_length_max, m_response_length_p99],
        docs_scanned => [m_docs_scanned_cnt, m_docs_scanned_sum, m_docs_scanned_min, m_docs_scanned_max, m_docs_scanned_p99],
        plan_time => [m_plan_time_cnt, m_plan_time_sum, m_plan_time_min, m_plan_time_max, m_plan_time_p99],
    }
    counters {
        qc_hit => [m_qc_hit_cnt, m_qc_hit_sum],
        full_scan => [m_full_scan_cnt, m_full_scan_sum],
        full_join => [m_full_join_cnt, m_full_join_sum],
        tmp_table => [m_tmp_table_cnt, m_tmp_table_sum],
        tmp_table_on_disk => [m_tmp_table_on_disk_cnt, m_tmp_table_on_disk_sum],
        filesort => [m_filesort_cnt, m_filesort_sum],
        filesort_on_disk => [m_filesort_on_disk_cnt, m_filesort_on_disk_sum],
        select_full_range_join => [m_select_full_range_join_cnt, m_select_full_range_join_sum],
        select_range => [m_select_range_cnt, m_select_range_sum],
        select_range_check => [m_select_range_check_cnt, m_select_range_check_sum],
        sort_range => [m_sort_range_cnt, m_sort_range_sum],
        sort_rows => [m_sort_rows_cnt, m_sort_rows_sum],
        sort_scan => [m_sort_scan_cnt, m_sort_scan_sum],
        no_index_used => [m_no_index_used_cnt, m_no_index_used_sum],
        no_good_index_used => [m_no_good_index_used_cnt, m_no_good_index_used_sum],
        shared_blks_hit => [m_shared_blks_hit_cnt, m_shared_blks_hit_sum],
        shared_blks_read => [m_shared_blks_read_cnt, m_shared_blks_read_sum],
        shared_blks_dirtied => [m_shared_blks_dirtied_cnt, m_shared_blks_dirtied_sum],
        shared_blks_written => [m_shared_blks_written_cnt, m_shared_blks_written_sum],
        local_blks_hit => [m_local_blks_hit_cnt, m_local_blks_hit_sum],
        local_blks_read => [m_local_blks_read_cnt, m_local_blks_read_sum],
        local_blks_dirtied => [m_local_blks_dirtied_cnt, m_local_blks_dirtied_sum],
        local_blks_written => [m_local_blks_written_cnt, m_local_blks_written_sum],
        temp_blks_read => [m_temp_blks_read_cnt, m_temp_blks_read_sum],
        temp_blks_written => [m_temp_blks_written_cnt, m_temp_blks_written_sum],
        shared_blk_read_time => [m_shared_blk_read_time_cnt, m_shared_blk_read_time_sum],
        shared_blk_write_time => [m_shared_blk_write_time_cnt, m_shared_blk_write_time_sum],
        local_blk_read_time => [m_local_blk_read_time_cnt, m_local_blk_read_time_sum],
        local_blk_write_time => [m_local_blk_write_time_cnt, m_local_blk_write_time_sum],
        cpu_user_time => [m_cpu_user_time_cnt, m_cpu_user_time_sum],
        cpu_sys_time => [m_cpu_sys_time_cnt, m_cpu_sys_time_sum],
        plans_calls => [m_plans_calls_cnt, m_plans_calls_sum],
        wal_records => [m_wal_records_cnt, m_wal_records_sum],
        wal_fpi => [m_wal_fpi_cnt, m_wal_fpi_sum],
        wal_bytes => [m_wal_bytes_cnt, m_wal_bytes_sum],
    }
}

/// Column names and ClickHouse types in [`MetricsRow`] order
pub fn table_columns() -> Vec<(String, &'static str)> {
    let mut cols: Vec<(String, &'static str)> = Dimension::ALL
        .iter()
        .map(|d| {
            let ty = if *d == Dimension::QueryId {
                "String"
            } else {
                "LowCardinality(String)"
            };
            (d.column().to_string(), ty)
        })
        .collect();
    cols.extend(
        [
            ("period_start", "DateTime"),
            ("period_length", "UInt32"),
            ("fingerprint", "String"),
            ("explain_fingerprint", "String"),
            ("placeholders_count", "UInt32"),
            ("tables", "Array(String)"),
            ("example", "String"),
            ("example_type", "UInt8"),
            ("is_truncated", "UInt8"),
            ("top_query", "String"),
            ("query_plan", "String"),
            ("histogram_items", "Array(String)"),
            ("labels.key", "Array(LowCardinality(String))"),
            ("labels.value", "Array(LowCardinality(String))"),
            ("warnings.code", "Array(UInt64)"),
            ("warnings.count", "Array(UInt64)"),
            ("errors.code", "Array(UInt64)"),
            ("errors.count", "Array(UInt64)"),
            ("num_queries", "UInt32"),
            ("num_queries_with_errors", "UInt32"),
            ("num_queries_with_warnings", "UInt32"),
        ]
        .iter()
        .map(|(c, t)| (c.to_string(), *t)),
    );
    for metric in columns::COMMON_METRICS {
        for facet in Facet::for_class(MetricClass::Common) {
            cols.push((columns::facet_column(metric, *facet), "Float32"));
        }
    }
    for metric in columns::COUNTER_METRICS {
        for facet in Facet::for_class(MetricClass::Counter) {
            cols.push((columns::facet_column(metric, *facet), "Float32"));
        }
    }
    cols
}

/// `CREATE TABLE IF NOT EXISTS metrics`, partitioned by day for retention
pub fn create_table_statement() -> String {
    let columns: Vec<String> = table_columns()
        .into_iter()
        .map(|(name, ty)| format!("`{}` {}", name, ty))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree \
         PARTITION BY toYYYYMMDD(period_start) \
         ORDER BY (queryid, service_name, database, schema, username, client_host, period_start)",
        METRICS_TABLE,
        columns.join(", ")
    )
}
