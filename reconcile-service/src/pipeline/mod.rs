pub mod stages;

use std::{collections::{BTreeMap, HashMap}, pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, TryStreamExt};
use series_client::{CanonicalRow, Entity};

use crate::{
    grid::GridError,
    merge::{MergeBatch, MergeError, MergeReport, MergeWindow, UpsertMerger},
    normalize::{NormalizedRecord, Normalizer},
    sources::ProviderRecord,
};

pub use stages::{process_all, process_entity, EngineSettings, EntityOutcome};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

/// A provider payload could not be read. Aborts the run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("source error: {0}")]
pub struct SourceError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("stage task failed: {0}")]
    Join(String),
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self) -> Pin<Box<dyn Stream<Item = Result<Envelope<T>, SourceError>> + Send>>;
}

/// Persistent home of canonical rows. Only the merger writes through it.
#[async_trait::async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Apply `batch` atomically: either every row is applied or none is.
    async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError>;

    /// Stored rows with `window.start <= ts < window.end`, ordered by entity then hour.
    async fn fetch_window(&self, window: &MergeWindow) -> Result<Vec<CanonicalRow>, MergeError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub records_read: usize,
    pub rejected: usize,
    pub unknown_entity: usize,
    pub entities: usize,
    pub candidates: usize,
    pub superseded: usize,
    pub filled: usize,
    pub interpolation_skipped: usize,
    pub empty_slots: usize,
    pub off_grid: usize,
    pub merge: MergeReport,
}

/// One reconciliation run: read every source, normalize, reconcile per
/// entity and merge the result into the store.
pub struct Pipeline<K> {
    pub sources: Vec<Arc<dyn Source<ProviderRecord>>>,
    pub normalizer: Normalizer,
    pub entities: Arc<HashMap<String, Entity>>,
    pub settings: Arc<EngineSettings>,
    pub merger: UpsertMerger<K>,
}

impl<K: CanonicalStore> Pipeline<K> {
    async fn collect_sources(&self) -> Result<Vec<Envelope<ProviderRecord>>, PipelineError> {
        let mut all = Vec::new();
        for source in &self.sources {
            let batch: Vec<Envelope<ProviderRecord>> = source.stream().await.try_collect().await.map_err(|e| {
                tracing::error!(source = source.name(), error = %e, "source failed, aborting run");
                e
            })?;
            tracing::info!(source = source.name(), records = batch.len(), "source read");
            all.extend(batch);
        }
        Ok(all)
    }

    /// Group normalized records by known entity, keeping delivery order.
    fn group_by_entity(
        &self,
        records: Vec<NormalizedRecord>,
        report: &mut RunReport,
    ) -> BTreeMap<String, Vec<NormalizedRecord>> {
        let mut grouped: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
        for r in records {
            if self.entities.contains_key(&r.entity_id) {
                grouped.entry(r.entity_id.clone()).or_default().push(r);
            } else {
                tracing::debug!(entity_id = %r.entity_id, provider = %r.provider, "no entity linkage, dropping");
                report.unknown_entity += 1;
            }
        }
        if report.unknown_entity > 0 {
            tracing::warn!(dropped = report.unknown_entity, "records for unknown entities dropped");
            metrics::counter!("reconcile_unknown_entity_total").increment(report.unknown_entity as u64);
        }
        grouped
    }

    pub async fn run(&self, window: MergeWindow) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();

        let envelopes = self.collect_sources().await?;
        report.records_read = envelopes.len();

        let normalized = self.normalizer.normalize_batch(envelopes);
        report.rejected = normalized.rejected;

        let grouped = self.group_by_entity(normalized.records, &mut report);
        report.entities = grouped.len();

        let entities = self.entities.clone();
        let settings = self.settings.clone();
        let outcomes = tokio::task::spawn_blocking(move || process_all(grouped, &entities, &settings))
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))??;

        let mut rows: Vec<CanonicalRow> = Vec::new();
        for o in outcomes {
            report.candidates += o.candidates;
            report.superseded += o.superseded;
            report.filled += o.filled;
            report.interpolation_skipped += o.interpolation_skipped;
            report.empty_slots += o.empty_slots;
            report.off_grid += o.off_grid;
            rows.extend(o.rows);
        }

        let batch = MergeBatch::new(window, rows, self.settings.priority.clone())?;
        report.merge = self.merger.merge(&batch).await?;

        tracing::info!(
            window_start = %window.start,
            window_end = %window.end,
            records = report.records_read,
            rejected = report.rejected,
            entities = report.entities,
            inserted = report.merge.inserted,
            updated = report.merge.updated,
            unchanged = report.merge.unchanged,
            skipped_lower_tier = report.merge.skipped_lower_tier,
            "reconciliation run complete"
        );
        Ok(report)
    }
}
