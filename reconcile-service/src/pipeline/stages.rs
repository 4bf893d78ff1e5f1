//! The pure per-entity stages: localize, grid, reconcile, interpolate.
//!
//! Entities share no state, so they are processed in parallel on the rayon
//! pool. The caller runs [`process_all`] on a blocking thread.

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use series_client::{CanonicalRow, Entity};
use time_tz::Tz;

use crate::{
    grid::{build_grid, localize_series, AmbiguousPolicy, GridError},
    interpolate::{interpolate_entity, InterpolationSettings},
    normalize::NormalizedRecord,
    reconcile::{reconcile_entity, RawObservation, TierPriority},
    resample::{resample_hourly, HourlyResample},
};

#[derive(Clone)]
pub struct EngineSettings {
    pub zone: &'static Tz,
    pub ambiguous: AmbiguousPolicy,
    pub priority: TierPriority,
    pub interpolation: InterpolationSettings,
    /// Store metric columns; every output row carries at least these.
    pub metrics: Vec<String>,
    /// Providers whose sub-hourly samples are folded to whole hours.
    pub resample: BTreeMap<String, HourlyResample>,
}

#[derive(Debug, Default)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub rows: Vec<CanonicalRow>,
    pub grid_slots: usize,
    pub candidates: usize,
    pub superseded: usize,
    pub filled: usize,
    pub interpolation_skipped: usize,
    pub empty_slots: usize,
    pub off_grid: usize,
}

fn localize_entity(
    entity_id: &str,
    records: Vec<NormalizedRecord>,
    settings: &EngineSettings,
) -> Result<Vec<RawObservation>, GridError> {
    let mut by_provider: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
    for r in records {
        by_provider.entry(r.provider.clone()).or_default().push(r);
    }

    let mut out = Vec::new();
    for (provider, series) in by_provider {
        let localized = localize_series(entity_id, series, settings.zone, settings.ambiguous)?;
        match settings.resample.get(&provider) {
            Some(plan) => out.extend(resample_hourly(localized, plan)),
            None => out.extend(localized),
        }
    }
    Ok(out)
}

/// Run every pure stage for one entity.
pub fn process_entity(
    entity: &Entity,
    records: Vec<NormalizedRecord>,
    settings: &EngineSettings,
) -> Result<EntityOutcome, GridError> {
    let observations = localize_entity(&entity.entity_id, records, settings)?;

    let first = observations.iter().map(|o| o.ts).min();
    let last = observations.iter().map(|o| o.ts).max();
    let grid = match (first, last) {
        (Some(first), Some(last)) => match entity.active_range(first, last) {
            Some((lo, hi)) => build_grid(lo, hi, settings.zone),
            None => Vec::new(),
        },
        _ => Vec::new(),
    };

    let reconciled = reconcile_entity(observations, &settings.priority);
    metrics::counter!("reconcile_candidates_total").increment(reconciled.candidates as u64);
    metrics::counter!("reconcile_superseded_total").increment(reconciled.superseded as u64);

    let interpolated = interpolate_entity(&grid, reconciled.observations, &settings.metrics, settings.interpolation);
    if interpolated.off_grid > 0 {
        tracing::debug!(
            entity_id = %entity.entity_id,
            off_grid = interpolated.off_grid,
            "observations outside the entity's validity dropped"
        );
    }

    Ok(EntityOutcome {
        entity_id: entity.entity_id.clone(),
        rows: interpolated.rows.into_iter().map(CanonicalRow::from).collect(),
        grid_slots: grid.len(),
        candidates: reconciled.candidates,
        superseded: reconciled.superseded,
        filled: interpolated.filled,
        interpolation_skipped: interpolated.skipped,
        empty_slots: interpolated.empty_slots,
        off_grid: interpolated.off_grid,
    })
}

/// Process every entity in parallel. The first grid error fails the whole run.
///
/// Groups whose entity is missing from `entities` are ignored; callers filter
/// them out beforehand.
pub fn process_all(
    grouped: BTreeMap<String, Vec<NormalizedRecord>>,
    entities: &HashMap<String, Entity>,
    settings: &EngineSettings,
) -> Result<Vec<EntityOutcome>, GridError> {
    grouped
        .into_par_iter()
        .filter_map(|(id, records)| entities.get(&id).map(|e| (e, records)))
        .map(|(entity, records)| process_entity(entity, records, settings))
        .collect()
}
