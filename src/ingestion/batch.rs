//! Time-window batching of collect requests into store transactions
//!
//! One call to [`BatchWriter::insert_batch`] opens a transaction, inserts the
//! first request and keeps absorbing requests from the queue until the
//! window closes or the queue is closed, then commits. There is no size
//! trigger: the whole window is written by one store insert.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::metrics::IngestionMetrics;
use crate::error::IngestionError;
use crate::store::AnalyticsStore;
use crate::types::CollectBatch;

/// Collect request waiting in the queue
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Buckets of the request
    pub batch: CollectBatch,
    /// Failed commits this request has been part of
    pub attempts: u32,
}

impl QueuedRequest {
    /// Wrap a freshly received request
    pub fn new(batch: CollectBatch) -> Self {
        Self { batch, attempts: 0 }
    }
}

/// Requests absorbed into one transaction
#[derive(Debug)]
pub struct PendingBatch {
    /// Requests in arrival order
    pub requests: Vec<QueuedRequest>,
    /// Buckets across all requests
    pub buckets: usize,
    started: Instant,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            buckets: 0,
            started: Instant::now(),
        }
    }

    fn push(&mut self, request: QueuedRequest) {
        self.buckets += request.batch.len();
        self.requests.push(request);
    }

    /// Time since the first request was taken
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Owner of the store-transaction lifecycle
pub struct BatchWriter {
    store: Arc<dyn AnalyticsStore>,
    metrics: Arc<IngestionMetrics>,
    /// Queue handle for requeueing; weak so it never keeps the queue open
    requeue: mpsc::WeakSender<QueuedRequest>,
    requeue_attempts: u32,
}

impl BatchWriter {
    /// Create a writer
    pub fn new(
        store: Arc<dyn AnalyticsStore>,
        metrics: Arc<IngestionMetrics>,
        requeue: mpsc::WeakSender<QueuedRequest>,
        requeue_attempts: u32,
    ) -> Self {
        Self {
            store,
            metrics,
            requeue,
            requeue_attempts,
        }
    }

    /// Write `first` and every request arriving within `window` in one
    /// transaction
    ///
    /// `None` disables the timer: requests are absorbed until the queue is
    /// closed and drained. Returns the number of buckets committed.
    pub async fn insert_batch(
        &self,
        first: QueuedRequest,
        rx: &mut mpsc::Receiver<QueuedRequest>,
        window: Option<Duration>,
    ) -> Result<usize, IngestionError> {
        let mut pending = PendingBatch::new();
        let result = self.write(first, rx, window, &mut pending).await;

        let elapsed = pending.age();
        crate::metrics::record_batch(pending.buckets, elapsed.as_secs_f64(), result.is_err());
        match result {
            Ok(()) => {
                info!("Saved {} buckets in {:?}.", pending.buckets, elapsed);
                self.metrics.record_saved(pending.buckets as u64, elapsed);
                Ok(pending.buckets)
            }
            Err(e) => {
                error!(
                    "Failed to save {} buckets in {:?}: {}.",
                    pending.buckets, elapsed, e
                );
                self.metrics.record_failed(elapsed);
                self.requeue_or_drop(pending);
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        first: QueuedRequest,
        rx: &mut mpsc::Receiver<QueuedRequest>,
        window: Option<Duration>,
        pending: &mut PendingBatch,
    ) -> Result<(), IngestionError> {
        pending.push(first);
        let deadline = window.map(|w| Instant::now() + w);
        let mut tx = self.store.begin().await?;

        let mut inserted = 0;
        loop {
            while inserted < pending.requests.len() {
                for bucket in &pending.requests[inserted].batch.metrics_bucket {
                    if let Err(e) = tx.insert(bucket).await {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!("Failed to roll back transaction: {}.", rollback_err);
                        }
                        return Err(e.into());
                    }
                }
                inserted += 1;
            }

            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => rx.recv().await,
            };
            match next {
                Some(request) => pending.push(request),
                None => {
                    warn!("Requests channel closed, exiting.");
                    break;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Put failed requests back into the queue while they have attempts
    /// left; the rest are lost
    fn requeue_or_drop(&self, pending: PendingBatch) {
        let sender = self.requeue.upgrade();
        for mut request in pending.requests {
            if request.attempts < self.requeue_attempts {
                if let Some(sender) = &sender {
                    request.attempts += 1;
                    match sender.try_send(request) {
                        Ok(()) => {
                            self.metrics.record_requeued();
                            continue;
                        }
                        Err(e) => request = e.into_inner(),
                    }
                }
            }
            warn!(
                "Dropping {} buckets after {} failed attempts",
                request.batch.len(),
                request.attempts
            );
            self.metrics.record_dropped(request.batch.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordingStore;
    use crate::types::MetricBucket;

    fn request(ids: &[&str]) -> QueuedRequest {
        QueuedRequest::new(CollectBatch::new(
            ids.iter().map(|id| MetricBucket::new(*id, 0, 60)).collect(),
        ))
    }

    fn writer(
        store: &RecordingStore,
        attempts: u32,
    ) -> (
        BatchWriter,
        mpsc::Sender<QueuedRequest>,
        mpsc::Receiver<QueuedRequest>,
        Arc<IngestionMetrics>,
    ) {
        let (tx, rx) = mpsc::channel(10);
        let metrics = Arc::new(IngestionMetrics::new());
        let writer = BatchWriter::new(
            Arc::new(store.clone()),
            Arc::clone(&metrics),
            tx.downgrade(),
            attempts,
        );
        (writer, tx, rx, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_absorbs_queued_requests_in_order() {
        let store = RecordingStore::new();
        let (writer, tx, mut rx, _) = writer(&store, 0);
        tx.send(request(&["Q2"])).await.unwrap();
        tx.send(request(&["Q3", "Q4"])).await.unwrap();

        let written = writer
            .insert_batch(request(&["Q1"]), &mut rx, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(written, 4);

        let commits = store.commits();
        assert_eq!(commits.len(), 1);
        let ids: Vec<_> = commits[0].iter().map(|b| b.queryid.as_str()).collect();
        assert_eq!(ids, vec!["Q1", "Q2", "Q3", "Q4"]);
    }

    #[tokio::test]
    async fn test_no_window_drains_closed_queue() {
        let store = RecordingStore::new();
        let (writer, tx, mut rx, _) = writer(&store, 0);
        tx.send(request(&["Q2"])).await.unwrap();
        rx.close();

        let written = writer
            .insert_batch(request(&["Q1"]), &mut rx, None)
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.commits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_failure_rolls_back_and_keeps_insert_error() {
        let store = RecordingStore::new();
        store.fail_next_inserts(1);
        store.fail_next_rollbacks(1);
        let (writer, _tx, mut rx, metrics) = writer(&store, 0);

        let err = writer
            .insert_batch(request(&["Q1", "Q2"]), &mut rx, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected insert failure"), "{}", err);
        assert_eq!(store.rollbacks(), 1);
        assert!(store.commits().is_empty());

        let stats = metrics.snapshot();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.buckets_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_drops_by_default() {
        let store = RecordingStore::new();
        store.fail_next_commits(1);
        let (writer, _tx, mut rx, metrics) = writer(&store, 0);

        let result = writer
            .insert_batch(request(&["Q1", "Q2"]), &mut rx, Some(Duration::from_millis(10)))
            .await;
        assert!(result.is_err());
        assert!(store.commits().is_empty());

        let stats = metrics.snapshot();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.buckets_dropped, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_requeues_within_attempts() {
        let store = RecordingStore::new();
        store.fail_next_commits(1);
        let (writer, _tx, mut rx, metrics) = writer(&store, 1);

        let _ = writer
            .insert_batch(request(&["Q1"]), &mut rx, Some(Duration::from_millis(10)))
            .await;
        let requeued = rx.try_recv().unwrap();
        assert_eq!(requeued.attempts, 1);
        assert_eq!(metrics.snapshot().requests_requeued, 1);

        store.fail_next_commits(1);
        let _ = writer
            .insert_batch(requeued, &mut rx, Some(Duration::from_millis(10)))
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().buckets_dropped, 1);
    }
}
