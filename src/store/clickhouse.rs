//! ClickHouse implementation of [`AnalyticsStore`]
//!
//! Reads use the `JSON` output format so that one response carries both the
//! grouped rows and the `WITH TOTALS` row. Inserts are staged in memory as
//! [`MetricsRow`]s and streamed as a single `RowBinary` insert on commit, so
//! one commit is one insert and a rollback simply drops the staged rows.

use async_trait::async_trait;
use ::clickhouse::query::Query;
use ::clickhouse::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::schema::{create_table_statement, MetricsRow};
use super::{AnalyticsStore, BoundQuery, InsertTransaction, Param, QueryOutput, Row, METRICS_TABLE};
use crate::error::StoreError;
use crate::types::MetricBucket;

/// Connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    /// HTTP endpoint, e.g. `http://127.0.0.1:8123`
    #[serde(default = "default_url")]
    pub url: String,

    /// Database holding the `metrics` table
    #[serde(default = "default_database")]
    pub database: String,

    /// User name
    #[serde(default)]
    pub user: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,
}

fn default_url() -> String {
    "http://127.0.0.1:8123".to_string()
}
fn default_database() -> String {
    "pmm".to_string()
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: default_database(),
            user: None,
            password: None,
        }
    }
}

/// `JSON` format response body
#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    totals: Option<Row>,
}

/// ClickHouse-backed store
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
}

impl ClickHouseStore {
    /// Create a store client
    ///
    /// No connection is made until the first statement runs.
    pub fn new(config: &ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_option("output_format_json_quote_64bit_integers", "0");

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        info!(
            "ClickHouse store configured for {} database {}",
            config.url, config.database
        );

        Self { client }
    }

    /// Check connectivity with a trivial query
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Create the `metrics` table if it does not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client
            .query(&create_table_statement())
            .execute()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn prepare(&self, query: &BoundQuery) -> Query {
        bind_all(self.client.query(query.sql()), query.params())
    }
}

fn bind_all(mut query: Query, params: &[Param]) -> Query {
    for param in params {
        query = match param {
            Param::Str(s) => query.bind(s.as_str()),
            Param::Int(v) => query.bind(*v),
            Param::UInt(v) => query.bind(*v),
            Param::Float(v) => query.bind(*v),
            Param::StrList(v) => query.bind(v.as_slice()),
            Param::UIntList(v) => query.bind(v.as_slice()),
        };
    }
    query
}

#[async_trait]
impl AnalyticsStore for ClickHouseStore {
    async fn begin(&self) -> Result<Box<dyn InsertTransaction>, StoreError> {
        Ok(Box::new(ClickHouseTransaction {
            client: self.client.clone(),
            rows: Vec::new(),
        }))
    }

    async fn query(&self, query: &BoundQuery) -> Result<QueryOutput, StoreError> {
        debug!("Running query: {}", query.sql());

        let mut cursor = self.prepare(query).fetch_bytes("JSON")?;
        let mut body = Vec::new();
        while let Some(chunk) = cursor.next().await? {
            body.extend_from_slice(&chunk);
        }

        let response: JsonResponse =
            serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(QueryOutput {
            rows: response.data,
            totals: response.totals,
        })
    }

    async fn execute(&self, query: &BoundQuery) -> Result<(), StoreError> {
        debug!("Executing statement: {}", query.sql());
        self.prepare(query).execute().await?;
        Ok(())
    }
}

/// Staged rows of one insert transaction
struct ClickHouseTransaction {
    client: Client,
    rows: Vec<MetricsRow>,
}

fn insert_error(e: ::clickhouse::error::Error) -> StoreError {
    StoreError::Insert(e.to_string())
}

#[async_trait]
impl InsertTransaction for ClickHouseTransaction {
    async fn insert(&mut self, bucket: &MetricBucket) -> Result<(), StoreError> {
        self.rows.push(MetricsRow::from_bucket(bucket));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<usize, StoreError> {
        let total = self.rows.len();
        if total == 0 {
            return Ok(0);
        }

        let mut insert = self
            .client
            .insert::<MetricsRow>(METRICS_TABLE)
            .map_err(insert_error)?;
        for row in &self.rows {
            insert.write(row).await.map_err(insert_error)?;
        }
        insert.end().await.map_err(insert_error)?;

        debug!("Inserted {} rows", total);
        Ok(total)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!("Discarding {} staged rows", self.rows.len());
        Ok(())
    }
}
