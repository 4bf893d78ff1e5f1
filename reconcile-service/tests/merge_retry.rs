use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use reconcile_service::{
    merge::{MergeBatch, MergeError, MergeReport, MergeWindow, UpsertMerger},
    pipeline::CanonicalStore,
    reconcile::TierPriority,
};
use series_client::{CanonicalRow, MetricMap, SourceTier};
use time::macros::datetime;

/// Fails the first `failures` merges with the given error, then succeeds.
struct FlakyStore {
    failures: u32,
    error: MergeError,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl CanonicalStore for FlakyStore {
    async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        Ok(MergeReport {
            inserted: batch.rows().len(),
            ..Default::default()
        })
    }

    async fn fetch_window(&self, _window: &MergeWindow) -> Result<Vec<CanonicalRow>, MergeError> {
        Ok(Vec::new())
    }
}

fn batch() -> MergeBatch {
    let window = MergeWindow::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC)).unwrap();
    let row = CanonicalRow {
        entity_id: "E1".to_string(),
        ts: datetime!(2024-01-01 02:00 UTC),
        source_tier: SourceTier::Archive,
        fetched_at: datetime!(2024-01-03 00:00 UTC),
        metrics: MetricMap::from([("temp".to_string(), Some(5.0))]),
    };
    MergeBatch::new(window, vec![row], TierPriority::default()).unwrap()
}

fn flaky(failures: u32, error: MergeError) -> FlakyStore {
    FlakyStore {
        failures,
        error,
        calls: AtomicU32::new(0),
    }
}

#[tokio::test]
async fn transient_failures_retry_the_whole_batch() {
    let merger = UpsertMerger::new(
        flaky(2, MergeError::Store("connection reset".to_string())),
        3,
        Duration::from_millis(1),
    );
    let report = merger.merge(&batch()).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.attempts, 3);
    assert_eq!(merger.store().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let merger = UpsertMerger::new(
        flaky(10, MergeError::Store("connection reset".to_string())),
        2,
        Duration::from_millis(1),
    );
    assert!(merger.merge(&batch()).await.is_err());
    assert_eq!(merger.store().calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conflicts_are_not_retried() {
    let merger = UpsertMerger::new(
        flaky(1, MergeError::Conflict("duplicate key".to_string())),
        5,
        Duration::from_millis(1),
    );
    let err = merger.merge(&batch()).await.unwrap_err();
    assert!(matches!(err, MergeError::Conflict(_)));
    assert_eq!(merger.store().calls.load(Ordering::SeqCst), 1);
}
