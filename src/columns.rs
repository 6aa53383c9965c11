//! Metric column taxonomy and dimension enumeration
//!
//! Every metric name belongs to exactly one class, and the class decides
//! which aggregate fragment a query emits for it:
//!
//! | class   | aggregates                                          |
//! |---------|-----------------------------------------------------|
//! | common  | `SUM(cnt)`, `SUM(sum)`, `MIN(min)`, `MAX(max)`, `AVG(p99)` |
//! | counter | `SUM(cnt)`, `SUM(sum)`                              |
//! | special | computed per name, no stored column                 |
//!
//! The tables below are immutable and shared by the ingestion insert
//! statement, the query builder and the filter discovery queries.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Metric classes
// ============================================================================

/// Aggregation class of a metric column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricClass {
    /// Stored with count, sum, min, max and p99 facets
    Common,
    /// Stored with count and sum facets only
    Counter,
    /// Derived from other columns, never stored under its own name
    Special,
}

/// Metrics stored with all five facets
pub const COMMON_METRICS: &[&str] = &[
    "query_time",
    "lock_time",
    "rows_sent",
    "rows_examined",
    "rows_affected",
    "rows_read",
    "merge_passes",
    "innodb_io_r_ops",
    "innodb_io_r_bytes",
    "innodb_io_r_wait",
    "innodb_rec_lock_wait",
    "innodb_queue_wait",
    "innodb_pages_distinct",
    "query_length",
    "bytes_sent",
    "tmp_tables",
    "tmp_disk_tables",
    "tmp_table_sizes",
    "docs_returned",
    "response_length",
    "docs_scanned",
    "plan_time",
];

/// Monotonic counters stored with count and sum only
pub const COUNTER_METRICS: &[&str] = &[
    "qc_hit",
    "full_scan",
    "full_join",
    "tmp_table",
    "tmp_table_on_disk",
    "filesort",
    "filesort_on_disk",
    "select_full_range_join",
    "select_range",
    "select_range_check",
    "sort_range",
    "sort_rows",
    "sort_scan",
    "no_index_used",
    "no_good_index_used",
    "shared_blks_hit",
    "shared_blks_read",
    "shared_blks_dirtied",
    "shared_blks_written",
    "local_blks_hit",
    "local_blks_read",
    "local_blks_dirtied",
    "local_blks_written",
    "temp_blks_read",
    "temp_blks_written",
    "shared_blk_read_time",
    "shared_blk_write_time",
    "local_blk_read_time",
    "local_blk_write_time",
    "cpu_user_time",
    "cpu_sys_time",
    "plans_calls",
    "wal_records",
    "wal_fpi",
    "wal_bytes",
];

/// Derived metrics
pub const SPECIAL_METRICS: &[&str] = &[
    "load",
    "num_queries",
    "num_queries_with_errors",
    "num_queries_with_warnings",
];

/// Common metrics measured in seconds; ordering by them uses the average
pub const TIME_METRICS: &[&str] = &[
    "query_time",
    "lock_time",
    "innodb_io_r_wait",
    "innodb_rec_lock_wait",
    "innodb_queue_wait",
    "plan_time",
];

/// Alias accepted in column lists and order-by for `num_queries`
pub const COUNT_ALIAS: &str = "count";

lazy_static! {
    static ref METRIC_CLASSES: HashMap<&'static str, MetricClass> = {
        let mut map = HashMap::new();
        for name in COMMON_METRICS {
            map.insert(*name, MetricClass::Common);
        }
        for name in COUNTER_METRICS {
            map.insert(*name, MetricClass::Counter);
        }
        for name in SPECIAL_METRICS {
            map.insert(*name, MetricClass::Special);
        }
        map
    };
}

/// Classify a metric name, `None` for unknown names
#[inline]
pub fn classify(name: &str) -> Option<MetricClass> {
    METRIC_CLASSES.get(name).copied()
}

/// Whether ordering by this metric should use its average
#[inline]
pub fn is_time_metric(name: &str) -> bool {
    TIME_METRICS.contains(&name)
}

/// Stored column name for one facet of a metric, e.g. `m_query_time_sum`
pub fn facet_column(metric: &str, facet: Facet) -> String {
    format!("m_{}_{}", metric, facet.suffix())
}

/// Stored facets of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    /// Number of samples carrying the metric
    Cnt,
    /// Sum of values
    Sum,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// Approximate 99th percentile
    P99,
}

impl Facet {
    /// Facets stored for a class
    pub fn for_class(class: MetricClass) -> &'static [Facet] {
        match class {
            MetricClass::Common => &[Facet::Cnt, Facet::Sum, Facet::Min, Facet::Max, Facet::P99],
            MetricClass::Counter => &[Facet::Cnt, Facet::Sum],
            MetricClass::Special => &[],
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Facet::Cnt => "cnt",
            Facet::Sum => "sum",
            Facet::Min => "min",
            Facet::Max => "max",
            Facet::P99 => "p99",
        }
    }
}

// ============================================================================
// Dimensions
// ============================================================================

macro_rules! dimensions {
    ($($variant:ident => $column:literal),+ $(,)?) => {
        /// Fixed, individually indexed categorical column of the metrics table
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Dimension {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
        }

        impl Dimension {
            /// Every dimension column, in table order
            pub const ALL: &'static [Dimension] = &[$(Dimension::$variant),+];

            /// Column name in the metrics table
            pub fn column(self) -> &'static str {
                match self {
                    $(Dimension::$variant => $column,)+
                }
            }
        }

        impl FromStr for Dimension {
            type Err = UnknownDimension;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($column => Ok(Dimension::$variant),)+
                    other => Err(UnknownDimension(other.to_string())),
                }
            }
        }
    };
}

dimensions! {
    QueryId => "queryid",
    ServiceName => "service_name",
    Database => "database",
    Schema => "schema",
    Username => "username",
    ClientHost => "client_host",
    ReplicationSet => "replication_set",
    Cluster => "cluster",
    ServiceType => "service_type",
    ServiceId => "service_id",
    Environment => "environment",
    Az => "az",
    Region => "region",
    NodeModel => "node_model",
    NodeId => "node_id",
    NodeName => "node_name",
    NodeType => "node_type",
    MachineId => "machine_id",
    ContainerName => "container_name",
    ContainerId => "container_id",
    AgentId => "agent_id",
    AgentType => "agent_type",
    CmdType => "cmd_type",
    TopQueryId => "top_queryid",
    ApplicationName => "application_name",
    PlanId => "planid",
    PlanSummary => "plan_summary",
}

/// Name that is not a dimension column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDimension(pub String);

impl fmt::Display for UnknownDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dimension: {}", self.0)
    }
}

impl std::error::Error for UnknownDimension {}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl Dimension {
    /// Whether reports may be grouped by this dimension
    pub fn is_groupable(self) -> bool {
        GROUP_BY_DIMENSIONS.contains(&self)
    }
}

/// Whether a name refers to a dimension column rather than a label key
#[inline]
pub fn is_dimension(name: &str) -> bool {
    Dimension::from_str(name).is_ok()
}

/// Dimensions a report may group by
pub const GROUP_BY_DIMENSIONS: &[Dimension] = &[
    Dimension::QueryId,
    Dimension::ServiceName,
    Dimension::Database,
    Dimension::Schema,
    Dimension::Username,
    Dimension::ClientHost,
    Dimension::CmdType,
    Dimension::ApplicationName,
    Dimension::TopQueryId,
    Dimension::PlanId,
];

/// Dimensions offered as filter pickers
pub const FILTER_DIMENSIONS: &[Dimension] = &[
    Dimension::ServiceName,
    Dimension::Database,
    Dimension::Schema,
    Dimension::Username,
    Dimension::ClientHost,
    Dimension::ReplicationSet,
    Dimension::Cluster,
    Dimension::ServiceType,
    Dimension::ServiceId,
    Dimension::Environment,
    Dimension::Az,
    Dimension::Region,
    Dimension::NodeModel,
    Dimension::NodeId,
    Dimension::NodeName,
    Dimension::NodeType,
    Dimension::MachineId,
    Dimension::ContainerName,
    Dimension::ContainerId,
    Dimension::CmdType,
    Dimension::TopQueryId,
    Dimension::ApplicationName,
    Dimension::PlanId,
    Dimension::PlanSummary,
];

/// Dimensions summarised in object metadata
pub const METADATA_DIMENSIONS: &[Dimension] = &[
    Dimension::ServiceName,
    Dimension::Database,
    Dimension::Schema,
    Dimension::Username,
    Dimension::ReplicationSet,
    Dimension::Cluster,
    Dimension::ServiceType,
    Dimension::Environment,
    Dimension::NodeName,
    Dimension::NodeType,
];
