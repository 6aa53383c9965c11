//! Ingestion batcher for agent metric buckets
//!
//! Collect handlers enqueue whole requests into a bounded queue and return;
//! a single consumer drains the queue into time-window batches, one store
//! transaction per batch. Writes are therefore serialized while reads run
//! concurrently against the store.
//!
//! # Architecture
//!
//! ```text
//! [Collect] ─save()─► [bounded queue] ─run()─► [BatchWriter] ─► [Store]
//!                          │                         │
//!                    requests_len/cap      buckets_per_batch, batch_save_seconds
//! ```
//!
//! # Consumer states
//!
//! - **Idle**: waiting for the first request, no timer running
//! - **Accumulating**: transaction open, absorbing requests until the
//!   batch window closes
//! - **Committing**: the transaction is committed or rolled back
//! - **Backoff**: after a failed batch the consumer sleeps for the error delay
//! - **Draining**: on shutdown the queue is closed and whatever is left is
//!   written in one final batch without a timer
//!
//! A failed batch is lost unless `requeue_attempts` allows its requests
//! back into the queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qan_analytics::ingestion::{IngestionConfig, Ingester};
//! use qan_analytics::store::RecordingStore;
//! use qan_analytics::types::{CollectBatch, MetricBucket};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ingester = Arc::new(Ingester::new(
//!     Arc::new(RecordingStore::new()),
//!     IngestionConfig::default(),
//! )?);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!
//! let consumer = Arc::clone(&ingester);
//! let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });
//!
//! ingester
//!     .save(CollectBatch::new(vec![MetricBucket::new("Q1", 1_700_000_000, 60)]))
//!     .await?;
//!
//! shutdown_tx.send(())?;
//! handle.await??;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod metrics;

pub use batch::{BatchWriter, PendingBatch, QueuedRequest};
pub use metrics::{IngestionMetrics, IngestionStats};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::error::IngestionError;
use crate::store::AnalyticsStore;
use crate::types::CollectBatch;

/// Queue capacity in collect requests
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Time a batch keeps absorbing requests after the first one
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(500);

/// Pause after a failed batch
pub const DEFAULT_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the ingestion batcher
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionConfig {
    /// Maximum queued collect requests before `save` blocks
    pub queue_capacity: usize,
    /// Batch window
    pub batch_window: Duration,
    /// Pause after a failed batch
    pub error_delay: Duration,
    /// Times a request may be put back after a failed commit
    pub requeue_attempts: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_window: DEFAULT_BATCH_WINDOW,
            error_delay: DEFAULT_ERROR_DELAY,
            requeue_attempts: 0,
        }
    }
}

impl IngestionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".to_string());
        }
        if self.batch_window.is_zero() {
            return Err("batch_window must be > 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Ingester
// ============================================================================

/// Bounded queue plus its single consumer
pub struct Ingester {
    sender: mpsc::Sender<QueuedRequest>,
    /// Taken by the consumer when it starts
    receiver: Mutex<Option<mpsc::Receiver<QueuedRequest>>>,
    writer: BatchWriter,
    metrics: Arc<IngestionMetrics>,
    config: IngestionConfig,
}

impl Ingester {
    /// Create the queue; nothing is written until [`Ingester::run`] starts
    pub fn new(store: Arc<dyn AnalyticsStore>, config: IngestionConfig) -> Result<Self, IngestionError> {
        config.validate().map_err(IngestionError::ConfigError)?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let metrics = Arc::new(IngestionMetrics::new());
        let writer = BatchWriter::new(
            store,
            Arc::clone(&metrics),
            sender.downgrade(),
            config.requeue_attempts,
        );
        crate::metrics::update_queue(0, config.queue_capacity);

        Ok(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            writer,
            metrics,
            config,
        })
    }

    /// Enqueue one collect request
    ///
    /// Blocks while the queue is full. Success means enqueued, not stored.
    /// Malformed buckets are logged, counted and left out; the rest of the
    /// request is enqueued. Returns the number of buckets enqueued.
    ///
    /// # Errors
    ///
    /// `IngestionError::ChannelClosed` if the consumer has shut down.
    pub async fn save(&self, mut batch: CollectBatch) -> Result<usize, IngestionError> {
        let received = batch.len();
        batch.metrics_bucket.retain(|bucket| match bucket.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(queryid = %bucket.queryid, "Skipping metrics bucket: {}", reason);
                false
            },
        });
        let rejected = received - batch.len();
        if rejected > 0 {
            self.metrics.record_rejected(rejected as u64);
            crate::metrics::record_rejected(rejected);
        }

        if batch.is_empty() {
            warn!("Nothing to save - no metrics buckets.");
            return Ok(0);
        }

        let buckets = batch.len();
        self.sender
            .send(QueuedRequest::new(batch))
            .await
            .map_err(|_| IngestionError::ChannelClosed)?;
        self.metrics.record_enqueued(buckets as u64);
        self.update_gauges();
        Ok(buckets)
    }

    /// Consume the queue until `shutdown` fires, then write what is left
    ///
    /// # Errors
    ///
    /// `IngestionError::ShutdownError` if the consumer was already started.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), IngestionError> {
        let mut rx = self.receiver.lock().take().ok_or_else(|| {
            IngestionError::ShutdownError("ingestion consumer already started".to_string())
        })?;
        info!(
            "Ingestion consumer started (queue capacity {}, batch window {:?})",
            self.config.queue_capacity, self.config.batch_window
        );

        loop {
            let first = tokio::select! {
                _ = shutdown.recv() => break,
                first = rx.recv() => first,
            };
            let Some(first) = first else {
                warn!("Requests channel closed, nothing to store.");
                break;
            };
            self.update_gauges();

            if self
                .writer
                .insert_batch(first, &mut rx, Some(self.config.batch_window))
                .await
                .is_err()
            {
                tokio::time::sleep(self.config.error_delay).await;
            }
            self.update_gauges();
        }

        warn!("Closing requests channel.");
        rx.close();
        while let Some(first) = rx.recv().await {
            let _ = self.writer.insert_batch(first, &mut rx, None).await;
        }
        self.update_gauges();

        info!("Ingestion consumer stopped: {}", self.stats());
        Ok(())
    }

    /// Requests waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Current counters
    pub fn stats(&self) -> IngestionStats {
        self.metrics.snapshot()
    }

    fn update_gauges(&self) {
        crate::metrics::update_queue(self.queue_len(), self.sender.max_capacity());
    }
}
