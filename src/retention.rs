//! Partition retention
//!
//! The `metrics` table is partitioned by `toYYYYMMDD(period_start)`. The
//! retention job lists the partitions older than the configured number of
//! days and drops them one by one. It runs once at startup and then on a
//! fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::{AnalyticsStore, BoundQuery, Param, RowExt};

/// Retention configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Keep this many days of data
    pub days: u32,
    /// Interval between runs
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl RetentionConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.days == 0 {
            return Err("Retention days must be > 0".to_string());
        }
        if self.interval.is_zero() {
            return Err("Retention interval must be > 0".to_string());
        }
        Ok(())
    }
}

/// Periodic partition pruning
pub struct RetentionJob {
    store: Arc<dyn AnalyticsStore>,
    database: String,
    config: RetentionConfig,
}

impl RetentionJob {
    /// Create a job pruning `database.metrics`
    pub fn new(
        store: Arc<dyn AnalyticsStore>,
        database: impl Into<String>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            database: database.into(),
            config,
        }
    }

    /// Prune now and then on every interval tick until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            days = self.config.days,
            interval = ?self.config.interval,
            "Retention job started"
        );

        // First tick completes immediately.
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Retention job broadcast receiver lagged");
                        }
                    }
                }
                _ = ticker.tick() => {
                    match self.drop_old_partitions().await {
                        Ok(dropped) if !dropped.is_empty() => {
                            info!(partitions = ?dropped, "Dropped old partitions");
                        }
                        Ok(_) => debug!("No partitions to drop"),
                        Err(e) => error!(error = %e, "Failed to list partitions"),
                    }
                }
            }
        }

        info!("Retention job stopped");
    }

    /// Drop every partition older than the retention window
    ///
    /// A failed drop is logged and skipped; the partition is retried on
    /// the next run. Returns the partitions that were dropped.
    pub async fn drop_old_partitions(&self) -> Result<Vec<String>, StoreError> {
        let partitions = self.old_partitions().await?;

        let mut dropped = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let statement = BoundQuery::new(
                "ALTER TABLE metrics DROP PARTITION ID ?",
                vec![Param::Str(partition.clone())],
            );
            match self.store.execute(&statement).await {
                Ok(()) => {
                    crate::metrics::record_partition_drop(true);
                    dropped.push(partition);
                }
                Err(e) => {
                    crate::metrics::record_partition_drop(false);
                    error!(partition = %partition, error = %e, "Failed to drop partition");
                }
            }
        }
        Ok(dropped)
    }

    async fn old_partitions(&self) -> Result<Vec<String>, StoreError> {
        let query = BoundQuery::new(
            "SELECT DISTINCT partition_id FROM system.parts \
             WHERE database = ? AND table = 'metrics' \
             AND toUInt32OrZero(partition_id) < toYYYYMMDD(now() - toIntervalDay(?)) \
             ORDER BY partition_id",
            vec![
                Param::Str(self.database.clone()),
                Param::UInt(u64::from(self.config.days)),
            ],
        );
        let output = self.store.query(&query).await?;

        let mut partitions = Vec::with_capacity(output.rows.len());
        for row in &output.rows {
            let partition = row.string("partition_id");
            if partition.is_empty() || !partition.bytes().all(|b| b.is_ascii_digit()) {
                warn!(partition = %partition, "Skipping unexpected partition id");
                continue;
            }
            partitions.push(partition);
        }
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{QueryOutput, RecordingStore, Row};
    use serde_json::json;

    fn row(partition: &str) -> Row {
        json!({ "partition_id": partition }).as_object().cloned().unwrap()
    }

    fn job(store: &RecordingStore, days: u32) -> RetentionJob {
        RetentionJob::new(
            Arc::new(store.clone()),
            "pmm",
            RetentionConfig {
                days,
                interval: Duration::from_secs(3600),
            },
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(RetentionConfig::default().validate().is_ok());
        let zero_days = RetentionConfig {
            days: 0,
            ..Default::default()
        };
        assert!(zero_days.validate().is_err());
        let zero_interval = RetentionConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[tokio::test]
    async fn test_drops_listed_partitions() {
        let store = RecordingStore::new();
        store.respond_with(|_| Ok(QueryOutput::rows(vec![row("20240101"), row("20240102")])));

        let dropped = job(&store, 7).drop_old_partitions().await.unwrap();
        assert_eq!(dropped, vec!["20240101", "20240102"]);

        let queries = store.queries();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].sql().contains("FROM system.parts"));
        assert_eq!(
            queries[0].params(),
            &[Param::Str("pmm".to_string()), Param::UInt(7)]
        );

        let statements = store.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].sql(), "ALTER TABLE metrics DROP PARTITION ID ?");
        assert_eq!(statements[1].params(), &[Param::Str("20240102".to_string())]);
    }

    #[tokio::test]
    async fn test_skips_non_numeric_partition() {
        let store = RecordingStore::new();
        store.respond_with(|_| Ok(QueryOutput::rows(vec![row("all"), row("20240101")])));

        let dropped = job(&store, 30).drop_old_partitions().await.unwrap();
        assert_eq!(dropped, vec!["20240101"]);
        assert_eq!(store.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let store = RecordingStore::new();
        store.respond_with(|_| Err(StoreError::Query("boom".to_string())));

        assert!(job(&store, 30).drop_old_partitions().await.is_err());
        assert!(store.statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_prunes_on_start_and_stops_on_shutdown() {
        let store = RecordingStore::new();
        store.respond_with(|_| Ok(QueryOutput::rows(vec![row("20240101")])));
        let job = Arc::new(job(&store, 30));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.statements().len(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.statements().len(), 2);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
