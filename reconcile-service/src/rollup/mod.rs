//! Regional rollups over canonical rows.

use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
};

use serde::Deserialize;
use series_client::{CanonicalRow, Entity};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    merge::{MergeError, MergeWindow},
    pipeline::CanonicalStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFn {
    Mean,
    Sum,
    Min,
    Max,
}

impl AggFn {
    /// Aggregate the non-null values; `None` when there are none.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let v = match self {
            AggFn::Mean => values.iter().sum::<f64>() / values.len() as f64,
            AggFn::Sum => values.iter().sum(),
            AggFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Some(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionRollup {
    pub region: String,
    pub ts: OffsetDateTime,
    /// Entities with a row in this hour.
    pub entities: usize,
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Default)]
pub struct RollupOutcome {
    /// Ordered by region, then hour.
    pub rollups: Vec<RegionRollup>,
    /// Rows whose entity is unknown or has no region.
    pub excluded_rows: usize,
}

/// Group rows by (region, hour) and apply `aggregations` (metric → function).
pub fn aggregate(
    rows: &[CanonicalRow],
    entities: &HashMap<String, Entity>,
    aggregations: &BTreeMap<String, AggFn>,
) -> RollupOutcome {
    let mut groups: BTreeMap<(String, OffsetDateTime), Vec<&CanonicalRow>> = BTreeMap::new();
    let mut excluded_rows = 0;
    for row in rows {
        match entities.get(&row.entity_id).and_then(|e| e.region.as_ref()) {
            Some(region) => groups.entry((region.clone(), row.ts)).or_default().push(row),
            None => excluded_rows += 1,
        }
    }
    if excluded_rows > 0 {
        tracing::warn!(excluded_rows, "rows without a known entity region left out of rollup");
    }

    let rollups = groups
        .into_iter()
        .map(|((region, ts), members)| {
            let values = aggregations
                .iter()
                .map(|(metric, f)| {
                    let present: Vec<f64> = members.iter().filter_map(|r| r.metric(metric)).collect();
                    (metric.clone(), f.apply(&present))
                })
                .collect();
            RegionRollup {
                region,
                ts,
                entities: members.len(),
                values,
            }
        })
        .collect();

    RollupOutcome { rollups, excluded_rows }
}

/// Read `window` from the canonical store and roll it up by region.
pub async fn rollup_window<K: CanonicalStore + ?Sized>(
    store: &K,
    window: &MergeWindow,
    entities: &HashMap<String, Entity>,
    aggregations: &BTreeMap<String, AggFn>,
) -> Result<RollupOutcome, MergeError> {
    let rows = store.fetch_window(window).await?;
    let outcome = aggregate(&rows, entities, aggregations);
    tracing::info!(
        rows = rows.len(),
        rollups = outcome.rollups.len(),
        excluded = outcome.excluded_rows,
        "rollup computed"
    );
    Ok(outcome)
}

/// Write rollups as CSV: `region, ts, entities, <metric>...`.
pub fn write_csv<W: Write>(
    out: W,
    rollups: &[RegionRollup],
    aggregations: &BTreeMap<String, AggFn>,
) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(out);

    let mut header = vec!["region".to_string(), "ts".to_string(), "entities".to_string()];
    header.extend(aggregations.keys().cloned());
    wtr.write_record(&header)?;

    for r in rollups {
        let mut record = vec![r.region.clone(), r.ts.format(&Rfc3339)?, r.entities.to_string()];
        for metric in aggregations.keys() {
            record.push(
                r.values
                    .get(metric)
                    .copied()
                    .flatten()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{merge::MergeBatch, reconcile::TierPriority, sinks::MemoryStore};
    use series_client::{EntityKind, MetricMap, SourceTier};
    use time::macros::datetime;

    fn row(entity: &str, temp: Option<f64>, wind: Option<f64>) -> CanonicalRow {
        CanonicalRow {
            entity_id: entity.to_string(),
            ts: datetime!(2024-01-01 02:00 UTC),
            source_tier: SourceTier::Archive,
            fetched_at: datetime!(2024-01-03 00:00 UTC),
            metrics: MetricMap::from([("temp".to_string(), temp), ("wind".to_string(), wind)]),
        }
    }

    fn entities() -> HashMap<String, Entity> {
        [
            Entity::new("691", EntityKind::Station).with_region("North"),
            Entity::new("1048", EntityKind::Station).with_region("North"),
            Entity::new("3379", EntityKind::Station).with_region("South"),
            Entity::new("DE-LU", EntityKind::Zone),
        ]
        .into_iter()
        .map(|e| (e.entity_id.clone(), e))
        .collect()
    }

    fn aggregations() -> BTreeMap<String, AggFn> {
        BTreeMap::from([("temp".to_string(), AggFn::Mean), ("wind".to_string(), AggFn::Max)])
    }

    #[test]
    fn means_and_maxima_per_region_ignore_nulls() {
        let rows = vec![
            row("691", Some(4.0), None),
            row("1048", Some(6.0), Some(3.0)),
            row("3379", None, None),
            row("DE-LU", Some(1.0), Some(1.0)),
            row("unknown", Some(1.0), Some(1.0)),
        ];
        let out = aggregate(&rows, &entities(), &aggregations());
        assert_eq!(out.excluded_rows, 2);
        assert_eq!(out.rollups.len(), 2);

        let north = &out.rollups[0];
        assert_eq!(north.region, "North");
        assert_eq!(north.entities, 2);
        assert_eq!(north.values["temp"], Some(5.0));
        assert_eq!(north.values["wind"], Some(3.0));

        let south = &out.rollups[1];
        assert_eq!(south.values["temp"], None);
    }

    #[test]
    fn sums_and_minima() {
        assert_eq!(AggFn::Sum.apply(&[1.0, 2.5]), Some(3.5));
        assert_eq!(AggFn::Min.apply(&[1.0, -2.5]), Some(-2.5));
        assert_eq!(AggFn::Mean.apply(&[]), None);
    }

    #[test]
    fn csv_output_leaves_nulls_blank() {
        let rows = vec![row("3379", None, Some(2.0))];
        let out = aggregate(&rows, &entities(), &aggregations());
        let mut buf = Vec::new();
        write_csv(&mut buf, &out.rollups, &aggregations()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "region,ts,entities,temp,wind\nSouth,2024-01-01T02:00:00Z,1,,2\n");
    }

    #[tokio::test]
    async fn rollup_reads_only_the_requested_window() {
        let store = MemoryStore::new(vec!["temp".to_string(), "wind".to_string()]);
        let wide = MergeWindow::new(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC)).unwrap();
        let mut late = row("1048", Some(9.0), None);
        late.ts = datetime!(2024-01-01 05:00 UTC);
        let rows = vec![row("691", Some(4.0), None), row("1048", Some(6.0), Some(3.0)), late];
        store
            .merge(&MergeBatch::new(wide, rows, TierPriority::default()).unwrap())
            .await
            .unwrap();

        let narrow = MergeWindow::new(datetime!(2024-01-01 02:00 UTC), datetime!(2024-01-01 03:00 UTC)).unwrap();
        let out = rollup_window(&store, &narrow, &entities(), &aggregations()).await.unwrap();
        assert_eq!(out.rollups.len(), 1);
        assert_eq!(out.rollups[0].region, "North");
        assert_eq!(out.rollups[0].entities, 2);
        assert_eq!(out.rollups[0].values["temp"], Some(5.0));
    }
}
