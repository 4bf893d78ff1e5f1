//! Incremental upsert of a bounded window into the canonical store.

use std::time::Duration as StdDuration;

use series_client::{domain::hour::{floor_hour, is_hour_aligned}, CanonicalRow};
use time::{Duration, OffsetDateTime};

use crate::{pipeline::CanonicalStore, reconcile::TierPriority};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    /// Duplicate key in a batch or a uniqueness violation from the store.
    #[error("merge conflict: {0}")]
    Conflict(String),
    #[error("invalid merge window: {0}")]
    InvalidWindow(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("failpoint '{0}' triggered")]
    Failpoint(String),
}

impl MergeError {
    /// Conflicts and bad windows fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MergeError::Store(_) | MergeError::Failpoint(_))
    }
}

/// Half-open `[start, end)` range of hours a merge may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl MergeWindow {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, MergeError> {
        if !is_hour_aligned(start) || !is_hour_aligned(end) {
            return Err(MergeError::InvalidWindow(format!(
                "bounds must be whole hours: [{start}, {end})"
            )));
        }
        if start >= end {
            return Err(MergeError::InvalidWindow(format!("empty window [{start}, {end})")));
        }
        Ok(Self { start, end })
    }

    /// The refresh window ending at the settle-lag cutoff.
    ///
    /// `end = floor_hour(now - settle_lag)`, `start = end - lookback`.
    pub fn trailing(now: OffsetDateTime, lookback: Duration, settle_lag: Duration) -> Result<Self, MergeError> {
        let end = floor_hour(now - settle_lag);
        Self::new(floor_hour(end - lookback), end)
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Rows staged for one atomic merge.
///
/// Rows outside the window are removed at construction; keys are unique and
/// sorted by (entity, ts).
#[derive(Debug, Clone)]
pub struct MergeBatch {
    window: MergeWindow,
    rows: Vec<CanonicalRow>,
    priority: TierPriority,
    outside_window: usize,
}

impl MergeBatch {
    pub fn new(window: MergeWindow, rows: Vec<CanonicalRow>, priority: TierPriority) -> Result<Self, MergeError> {
        let total = rows.len();
        let mut rows: Vec<CanonicalRow> = rows.into_iter().filter(|r| window.contains(r.ts)).collect();
        let outside_window = total - rows.len();

        rows.sort_by(|a, b| a.entity_id.cmp(&b.entity_id).then(a.ts.cmp(&b.ts)));
        if let Some(pair) = rows
            .windows(2)
            .find(|p| p[0].entity_id == p[1].entity_id && p[0].ts == p[1].ts)
        {
            return Err(MergeError::Conflict(format!(
                "duplicate key ({}, {}) in batch",
                pair[0].entity_id, pair[0].ts
            )));
        }

        Ok(Self {
            window,
            rows,
            priority,
            outside_window,
        })
    }

    pub fn window(&self) -> &MergeWindow {
        &self.window
    }

    pub fn rows(&self) -> &[CanonicalRow] {
        &self.rows
    }

    pub fn priority(&self) -> &TierPriority {
        &self.priority
    }

    pub fn outside_window(&self) -> usize {
        self.outside_window
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct entity ids, sorted.
    pub fn entity_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.rows.iter().map(|r| r.entity_id.as_str()).collect();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_lower_tier: usize,
    pub outside_window: usize,
    pub attempts: u32,
}

impl MergeReport {
    pub fn touched(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Applies batches to a [`CanonicalStore`], retrying whole batches on
/// transient failures with linear backoff.
pub struct UpsertMerger<K> {
    store: K,
    max_retries: u32,
    retry_backoff: StdDuration,
}

impl<K: CanonicalStore> UpsertMerger<K> {
    pub fn new(store: K, max_retries: u32, retry_backoff: StdDuration) -> Self {
        Self {
            store,
            max_retries,
            retry_backoff,
        }
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        if batch.outside_window() > 0 {
            tracing::info!(
                outside_window = batch.outside_window(),
                "rows outside the merge window were not staged"
            );
        }
        if batch.is_empty() {
            return Ok(MergeReport {
                outside_window: batch.outside_window(),
                ..Default::default()
            });
        }

        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match self.store.merge(batch).await {
                Ok(mut report) => {
                    report.outside_window = batch.outside_window();
                    report.attempts = attempt + 1;

                    metrics::counter!("merge_rows_inserted_total").increment(report.inserted as u64);
                    metrics::counter!("merge_rows_updated_total").increment(report.updated as u64);
                    metrics::counter!("merge_rows_unchanged_total").increment(report.unchanged as u64);
                    metrics::counter!("merge_rows_skipped_lower_tier_total")
                        .increment(report.skipped_lower_tier as u64);
                    metrics::histogram!("merge_duration_seconds").record(started.elapsed().as_secs_f64());

                    if report.skipped_lower_tier > 0 {
                        tracing::info!(
                            skipped = report.skipped_lower_tier,
                            "incoming rows ranked below stored rows and were not applied"
                        );
                    }
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "canonical merge failed, retrying whole batch with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "canonical merge failed, giving up");
                    metrics::counter!("merge_errors_total").increment(1);
                    return Err(e);
                }
            }
        }
    }
}
