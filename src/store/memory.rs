//! In-memory store that records writes and serves scripted reads
//!
//! Used by tests and local development: committed buckets are kept per
//! commit, every query is logged, and reads are answered by a responder
//! closure. Insert, commit and rollback failures can be injected to
//! exercise the batcher's failure paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{AnalyticsStore, BoundQuery, InsertTransaction, QueryOutput};
use crate::error::StoreError;
use crate::types::MetricBucket;

type Responder = dyn Fn(&BoundQuery) -> Result<QueryOutput, StoreError> + Send + Sync;

#[derive(Default)]
struct State {
    commits: Vec<Vec<MetricBucket>>,
    rollbacks: usize,
    queries: Vec<BoundQuery>,
    statements: Vec<BoundQuery>,
    failing_inserts: usize,
    failing_commits: usize,
    failing_rollbacks: usize,
}

/// Recording store
#[derive(Clone)]
pub struct RecordingStore {
    state: Arc<Mutex<State>>,
    responder: Arc<Mutex<Arc<Responder>>>,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStore {
    /// Store whose reads return no rows
    pub fn new() -> Self {
        let responder: Arc<Responder> = Arc::new(|_: &BoundQuery| Ok(QueryOutput::default()));
        Self {
            state: Arc::new(Mutex::new(State::default())),
            responder: Arc::new(Mutex::new(responder)),
        }
    }

    /// Answer reads with `responder`
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&BoundQuery) -> Result<QueryOutput, StoreError> + Send + Sync + 'static,
    {
        let responder: Arc<Responder> = Arc::new(responder);
        *self.responder.lock() = responder;
    }

    /// Make the next `n` staged inserts fail
    pub fn fail_next_inserts(&self, n: usize) {
        self.state.lock().failing_inserts = n;
    }

    /// Make the next `n` commits fail
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().failing_commits = n;
    }

    /// Make the next `n` rollbacks fail; they are still counted
    pub fn fail_next_rollbacks(&self, n: usize) {
        self.state.lock().failing_rollbacks = n;
    }

    /// Buckets of each successful commit, in commit order
    pub fn commits(&self) -> Vec<Vec<MetricBucket>> {
        self.state.lock().commits.clone()
    }

    /// Every committed bucket in commit order
    pub fn committed_buckets(&self) -> Vec<MetricBucket> {
        self.state.lock().commits.iter().flatten().cloned().collect()
    }

    /// Number of rolled back transactions
    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Read queries seen so far
    pub fn queries(&self) -> Vec<BoundQuery> {
        self.state.lock().queries.clone()
    }

    /// Statements executed so far
    pub fn statements(&self) -> Vec<BoundQuery> {
        self.state.lock().statements.clone()
    }
}

#[async_trait]
impl AnalyticsStore for RecordingStore {
    async fn begin(&self) -> Result<Box<dyn InsertTransaction>, StoreError> {
        Ok(Box::new(RecordingTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn query(&self, query: &BoundQuery) -> Result<QueryOutput, StoreError> {
        self.state.lock().queries.push(query.clone());
        let responder = Arc::clone(&*self.responder.lock());
        responder(query)
    }

    async fn execute(&self, query: &BoundQuery) -> Result<(), StoreError> {
        self.state.lock().statements.push(query.clone());
        Ok(())
    }
}

struct RecordingTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<MetricBucket>,
}

#[async_trait]
impl InsertTransaction for RecordingTransaction {
    async fn insert(&mut self, bucket: &MetricBucket) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            if state.failing_inserts > 0 {
                state.failing_inserts -= 1;
                return Err(StoreError::Insert("injected insert failure".to_string()));
            }
        }
        self.staged.push(bucket.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<usize, StoreError> {
        let RecordingTransaction { state, staged } = *self;
        let mut state = state.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Insert("injected commit failure".to_string()));
        }
        let written = staged.len();
        state.commits.push(staged);
        Ok(written)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.rollbacks += 1;
        if state.failing_rollbacks > 0 {
            state.failing_rollbacks -= 1;
            return Err(StoreError::Query("injected rollback failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Param;

    #[tokio::test]
    async fn test_commit_records_buckets() {
        let store = RecordingStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&MetricBucket::new("Q1", 0, 60)).await.unwrap();
        tx.insert(&MetricBucket::new("Q2", 0, 60)).await.unwrap();
        assert_eq!(tx.commit().await.unwrap(), 2);
        assert_eq!(store.commits().len(), 1);
        assert_eq!(store.committed_buckets()[1].queryid, "Q2");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = RecordingStore::new();
        store.fail_next_commits(1);
        let tx = store.begin().await.unwrap();
        assert!(tx.commit().await.is_err());
        let tx = store.begin().await.unwrap();
        assert!(tx.commit().await.is_ok());
    }

    #[tokio::test]
    async fn test_responder_and_query_log() {
        let store = RecordingStore::new();
        store.respond_with(|_| Err(StoreError::Query("boom".into())));
        let q = BoundQuery::new("SELECT ?", vec![Param::Int(1)]);
        assert!(store.query(&q).await.is_err());
        assert_eq!(store.queries(), vec![q]);
    }
}
