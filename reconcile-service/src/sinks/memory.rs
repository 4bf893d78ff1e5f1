use std::collections::{BTreeMap, HashSet};

use series_client::{CanonicalRow, SeriesKey};
use tokio::sync::Mutex;

use crate::{
    merge::{MergeBatch, MergeError, MergeReport, MergeWindow},
    pipeline::CanonicalStore,
};

use super::{maybe_failpoint, project, FAILPOINT_AFTER_STAGE, FAILPOINT_BEFORE_COMMIT};

/// In-process canonical store for tests and dry runs.
///
/// A store-wide mutex serializes merges. Changes are staged first and applied
/// only after every failpoint has passed, so a failed merge leaves the rows
/// untouched.
pub struct MemoryStore {
    columns: Vec<String>,
    rows: Mutex<BTreeMap<SeriesKey, CanonicalRow>>,
    failpoints: HashSet<String>,
}

impl MemoryStore {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Mutex::new(BTreeMap::new()),
            failpoints: HashSet::new(),
        }
    }

    pub fn with_failpoints<I, S>(mut self, failpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failpoints = failpoints.into_iter().map(Into::into).collect();
        self
    }

    /// All rows, ordered by (entity, ts).
    pub async fn snapshot(&self) -> Vec<CanonicalRow> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl CanonicalStore for MemoryStore {
    async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        let mut rows = self.rows.lock().await;
        let priority = batch.priority();

        let mut report = MergeReport::default();
        let mut staged: Vec<CanonicalRow> = Vec::new();
        for incoming in batch.rows() {
            let incoming = project(incoming, &self.columns);
            match rows.get(&incoming.key()) {
                None => {
                    report.inserted += 1;
                    staged.push(incoming);
                }
                Some(stored) if priority.outranks(stored.source_tier, incoming.source_tier) => {
                    report.skipped_lower_tier += 1;
                }
                Some(stored) if stored.same_content(&incoming, &self.columns) => {
                    report.unchanged += 1;
                }
                Some(_) => {
                    report.updated += 1;
                    staged.push(incoming);
                }
            }
        }

        maybe_failpoint(&self.failpoints, FAILPOINT_AFTER_STAGE)?;
        maybe_failpoint(&self.failpoints, FAILPOINT_BEFORE_COMMIT)?;

        for row in staged {
            rows.insert(row.key(), row);
        }
        Ok(report)
    }

    async fn fetch_window(&self, window: &MergeWindow) -> Result<Vec<CanonicalRow>, MergeError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|r| window.contains(r.ts)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::TierPriority;
    use series_client::{MetricMap, SourceTier};
    use time::macros::datetime;

    fn window() -> MergeWindow {
        MergeWindow::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC)).unwrap()
    }

    fn row(tier: SourceTier, temp: Option<f64>) -> CanonicalRow {
        CanonicalRow {
            entity_id: "E1".to_string(),
            ts: datetime!(2024-01-01 02:00 UTC),
            source_tier: tier,
            fetched_at: datetime!(2024-01-03 00:00 UTC),
            metrics: MetricMap::from([("temp".to_string(), temp), ("ignored".to_string(), Some(1.0))]),
        }
    }

    fn batch(rows: Vec<CanonicalRow>) -> MergeBatch {
        MergeBatch::new(window(), rows, TierPriority::default()).unwrap()
    }

    #[tokio::test]
    async fn insert_then_identical_merge_is_a_noop() {
        let store = MemoryStore::new(vec!["temp".to_string()]);
        let first = store.merge(&batch(vec![row(SourceTier::Archive, Some(5.0))])).await.unwrap();
        assert_eq!(first.inserted, 1);

        let before = store.snapshot().await;
        let second = store.merge(&batch(vec![row(SourceTier::Archive, Some(5.0))])).await.unwrap();
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.touched(), 0);
        assert_eq!(store.snapshot().await, before);
        assert!(!before[0].metrics.contains_key("ignored"));
    }

    #[tokio::test]
    async fn lower_tier_never_overwrites_and_higher_tier_does() {
        let store = MemoryStore::new(vec!["temp".to_string()]);
        store.merge(&batch(vec![row(SourceTier::Archive, Some(5.0))])).await.unwrap();

        let forecast = store.merge(&batch(vec![row(SourceTier::Forecast, Some(5.5))])).await.unwrap();
        assert_eq!(forecast.skipped_lower_tier, 1);
        assert_eq!(store.snapshot().await[0].metric("temp"), Some(5.0));

        let correction = store.merge(&batch(vec![row(SourceTier::Correction, Some(4.8))])).await.unwrap();
        assert_eq!(correction.updated, 1);
        let stored = store.snapshot().await;
        assert_eq!(stored[0].metric("temp"), Some(4.8));
        assert_eq!(stored[0].source_tier, SourceTier::Correction);
    }

    #[tokio::test]
    async fn failpoint_leaves_store_untouched() {
        let store = MemoryStore::new(vec!["temp".to_string()]).with_failpoints(["before_commit"]);
        let err = store.merge(&batch(vec![row(SourceTier::Archive, Some(5.0))])).await.unwrap_err();
        assert_eq!(err, MergeError::Failpoint("before_commit".to_string()));
        assert!(store.snapshot().await.is_empty());
    }

    fn at(hour: u8, tier: SourceTier, temp: f64) -> CanonicalRow {
        CanonicalRow {
            ts: datetime!(2024-01-01 00:00 UTC) + time::Duration::hours(i64::from(hour)),
            ..row(tier, Some(temp))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_concurrent_merges_lose_no_update() {
        let store = std::sync::Arc::new(MemoryStore::new(vec!["temp".to_string()]));
        let archive = batch((0..4).map(|h| at(h, SourceTier::Archive, 1.0)).collect());
        let correction = batch((2..6).map(|h| at(h, SourceTier::Correction, 2.0)).collect());

        let (a, b) = tokio::join!(
            {
                let store = store.clone();
                async move { store.merge(&archive).await }
            },
            {
                let store = store.clone();
                async move { store.merge(&correction).await }
            }
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        // Whichever ran second either updated or skipped the two shared hours.
        assert_eq!(a.inserted + b.inserted, 6);
        assert_eq!(a.updated + b.updated + a.skipped_lower_tier + b.skipped_lower_tier, 2);

        let stored = store.snapshot().await;
        let temps: Vec<_> = stored.iter().map(|r| r.metric("temp")).collect();
        assert_eq!(temps, vec![Some(1.0), Some(1.0), Some(2.0), Some(2.0), Some(2.0), Some(2.0)]);
        assert!(stored[2..].iter().all(|r| r.source_tier == SourceTier::Correction));
    }

    #[tokio::test]
    async fn fetch_window_is_half_open() {
        let store = MemoryStore::new(vec!["temp".to_string()]);
        store
            .merge(&batch((0..4).map(|h| at(h, SourceTier::Archive, f64::from(h))).collect()))
            .await
            .unwrap();
        let w = MergeWindow::new(datetime!(2024-01-01 01:00 UTC), datetime!(2024-01-01 03:00 UTC)).unwrap();
        let rows = store.fetch_window(&w).await.unwrap();
        let hours: Vec<_> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(hours, vec![datetime!(2024-01-01 01:00 UTC), datetime!(2024-01-01 02:00 UTC)]);
    }
}
