//! Ingestion Pipeline Integration Tests
//!
//! Runs the batcher against the recording store on a paused clock, so
//! batch windows and error delays are exact.
//!
//! # Test Coverage
//!
//! 1. **Windowing** - Consecutive windows produce separate commits
//! 2. **Ordering** - Buckets are committed in arrival order
//! 3. **Backpressure** - `save` waits while the queue is full; malformed
//!    buckets are skipped without holding back the rest
//! 4. **Shutdown** - Accumulating batch and queued requests are flushed

use qan_analytics::config::Config;
use qan_analytics::error::IngestionError;
use qan_analytics::ingestion::{IngestionConfig, Ingester};
use qan_analytics::store::RecordingStore;
use qan_analytics::types::{CollectBatch, MetricBucket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// =============================================================================
// Test Helpers
// =============================================================================

fn batch(ids: &[&str]) -> CollectBatch {
    CollectBatch::new(
        ids.iter()
            .map(|id| MetricBucket::new(*id, 1_700_000_000, 60))
            .collect(),
    )
}

struct Pipeline {
    store: RecordingStore,
    ingester: Arc<Ingester>,
    shutdown: broadcast::Sender<()>,
    consumer: JoinHandle<Result<(), IngestionError>>,
}

fn start(config: IngestionConfig) -> Pipeline {
    let store = RecordingStore::new();
    let ingester = Arc::new(
        Ingester::new(Arc::new(store.clone()), config).expect("valid ingestion config"),
    );
    let (shutdown, rx) = broadcast::channel(1);
    let consumer = {
        let ingester = Arc::clone(&ingester);
        tokio::spawn(async move { ingester.run(rx).await })
    };
    Pipeline {
        store,
        ingester,
        shutdown,
        consumer,
    }
}

fn committed_ids(store: &RecordingStore) -> Vec<Vec<String>> {
    store
        .commits()
        .into_iter()
        .map(|commit| commit.into_iter().map(|b| b.queryid).collect())
        .collect()
}

// =============================================================================
// Windowing and Ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_consecutive_windows_commit_separately() {
    let p = start(IngestionConfig::default());

    p.ingester.save(batch(&["A1", "A2"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    p.ingester.save(batch(&["A3"])).await.unwrap();

    // First window closes 500ms after A1 arrived
    tokio::time::sleep(Duration::from_millis(400)).await;
    p.ingester.save(batch(&["B1"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(
        committed_ids(&p.store),
        vec![
            vec!["A1".to_string(), "A2".to_string(), "A3".to_string()],
            vec!["B1".to_string()],
        ]
    );

    let stats = p.ingester.stats();
    assert_eq!(stats.batches_saved, 2);
    assert_eq!(stats.buckets_saved, 4);
    assert_eq!(stats.buckets_enqueued, 4);
}

#[tokio::test(start_paused = true)]
async fn test_config_file_settings_drive_the_window() {
    let config: Config = toml::from_str(
        r#"
        [ingestion]
        batch_window_ms = 100
        "#,
    )
    .unwrap();
    let p = start(config.ingestion.to_ingestion_config());

    p.ingester.save(batch(&["Q1"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(p.store.commits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_buckets_do_not_block_the_rest() {
    let p = start(IngestionConfig::default());

    let mut mixed = batch(&["Q1", "", "Q2"]);
    mixed.metrics_bucket[2]
        .metrics
        .insert("made_up".to_string(), Default::default());
    mixed.metrics_bucket.push(MetricBucket::new("Q3", 1_700_000_000, 60));

    assert_eq!(p.ingester.save(mixed).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(
        committed_ids(&p.store),
        vec![vec!["Q1".to_string(), "Q3".to_string()]]
    );
    let stats = p.ingester.stats();
    assert_eq!(stats.buckets_rejected, 2);
    assert_eq!(stats.buckets_saved, 2);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_save_waits_while_queue_is_full() {
    let store = RecordingStore::new();
    let config = IngestionConfig {
        queue_capacity: 2,
        ..Default::default()
    };
    // No consumer: the queue only fills
    let ingester = Arc::new(Ingester::new(Arc::new(store), config).unwrap());

    ingester.save(batch(&["Q1"])).await.unwrap();
    ingester.save(batch(&["Q2"])).await.unwrap();
    assert_eq!(ingester.queue_len(), 2);

    let blocked = tokio::time::timeout(Duration::from_secs(5), ingester.save(batch(&["Q3"]))).await;
    assert!(blocked.is_err(), "save returned while the queue was full");
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_window_loses_nothing() {
    let p = start(IngestionConfig::default());

    p.ingester.save(batch(&["Q1"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    p.ingester.save(batch(&["Q2", "Q3"])).await.unwrap();

    p.shutdown.send(()).unwrap();
    p.consumer.await.unwrap().unwrap();

    let saved: Vec<String> = committed_ids(&p.store).into_iter().flatten().collect();
    assert_eq!(saved, vec!["Q1", "Q2", "Q3"]);
    assert_eq!(p.ingester.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_final_flush_failure_is_reported_in_stats() {
    let p = start(IngestionConfig::default());
    p.store.fail_next_commits(1);

    p.ingester.save(batch(&["Q1", "Q2"])).await.unwrap();
    p.shutdown.send(()).unwrap();
    p.consumer.await.unwrap().unwrap();

    assert!(p.store.commits().is_empty());
    let stats = p.ingester.stats();
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.buckets_dropped, 2);
}
