//! Bounded linear gap filling per entity and metric.

use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::{grid::GridSlot, reconcile::ReconciledObservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpolationSettings {
    /// Widest run of missing hours that may be bridged.
    pub max_gap_hours: u32,
}

impl Default for InterpolationSettings {
    fn default() -> Self {
        Self { max_gap_hours: 6 }
    }
}

#[derive(Debug, Default)]
pub struct InterpolateOutcome {
    pub rows: Vec<ReconciledObservation>,
    /// Metric values filled in.
    pub filled: usize,
    /// Missing values left null: series boundary or gap wider than allowed.
    pub skipped: usize,
    /// Grid slots without any reconciled observation; not synthesized.
    pub empty_slots: usize,
    /// Observations whose timestamp is not on the grid.
    pub off_grid: usize,
}

struct Known {
    row: usize,
    ts: OffsetDateTime,
    value: f64,
}

fn lerp(before: &Known, after: &Known, ts: OffsetDateTime) -> f64 {
    let span = (after.ts - before.ts).whole_seconds() as f64;
    let offset = (ts - before.ts).whole_seconds() as f64;
    before.value + (after.value - before.value) * offset / span
}

/// Fill isolated missing metric values of one entity's reconciled series.
///
/// Only values known for the same entity and metric are used, and only gaps
/// bracketed on both sides by known values at most `max_gap_hours` apart are
/// bridged. The metric set is `declared` plus every metric the series carries.
pub fn interpolate_entity(
    grid: &[GridSlot],
    observations: Vec<ReconciledObservation>,
    declared: &[String],
    settings: InterpolationSettings,
) -> InterpolateOutcome {
    let slots: BTreeSet<OffsetDateTime> = grid.iter().map(|s| s.ts).collect();
    let mut by_ts: BTreeMap<OffsetDateTime, ReconciledObservation> = BTreeMap::new();
    let mut off_grid = 0;
    for o in observations {
        if slots.contains(&o.ts) {
            by_ts.insert(o.ts, o);
        } else {
            off_grid += 1;
        }
    }

    let mut out = InterpolateOutcome {
        empty_slots: slots.len() - by_ts.len(),
        off_grid,
        ..Default::default()
    };
    let mut rows: Vec<ReconciledObservation> = by_ts.into_values().collect();

    let mut metric_names: BTreeSet<String> = declared.iter().cloned().collect();
    for r in &rows {
        metric_names.extend(r.metrics.keys().cloned());
    }

    let max_span = i64::from(settings.max_gap_hours) + 1;
    for name in &metric_names {
        let known: Vec<Known> = rows
            .iter()
            .enumerate()
            .filter_map(|(row, r)| match r.metrics.get(name) {
                Some(Some(v)) if v.is_finite() => Some(Known { row, ts: r.ts, value: *v }),
                _ => None,
            })
            .collect();

        for (j, r) in rows.iter_mut().enumerate() {
            if matches!(r.metrics.get(name), Some(Some(v)) if v.is_finite()) {
                continue;
            }
            let next = known.partition_point(|k| k.row < j);
            let filled = match (next.checked_sub(1).and_then(|p| known.get(p)), known.get(next)) {
                (Some(before), Some(after)) if (after.ts - before.ts).whole_hours() <= max_span => {
                    Some(lerp(before, after, r.ts))
                }
                _ => None,
            };
            if filled.is_some() {
                out.filled += 1;
            } else {
                out.skipped += 1;
            }
            r.metrics.insert(name.clone(), filled);
        }
    }

    metrics::counter!("interpolate_filled_total").increment(out.filled as u64);
    metrics::counter!("interpolate_skipped_total").increment(out.skipped as u64);
    out.rows = rows;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::build_grid;
    use series_client::{MetricMap, SourceTier};
    use time::{macros::datetime, Duration};
    use time_tz::timezones;

    const START: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

    fn row(hour: i64, temp: Option<f64>) -> ReconciledObservation {
        ReconciledObservation {
            entity_id: "E1".to_string(),
            ts: START + Duration::hours(hour),
            tier: SourceTier::Archive,
            fetched_at: datetime!(2024-01-05 00:00 UTC),
            metrics: MetricMap::from([("temp".to_string(), temp)]),
        }
    }

    fn grid(hours: i64) -> Vec<GridSlot> {
        build_grid(START, START + Duration::hours(hours - 1), timezones::db::europe::BERLIN)
    }

    fn temps(out: &InterpolateOutcome) -> Vec<Option<f64>> {
        out.rows.iter().map(|r| r.metrics["temp"]).collect()
    }

    #[test]
    fn isolated_hole_is_filled_and_edges_stay_null() {
        let rows = vec![
            row(0, None),
            row(1, Some(2.0)),
            row(2, None),
            row(3, Some(4.0)),
            row(4, None),
        ];
        let out = interpolate_entity(&grid(5), rows, &[], InterpolationSettings::default());
        assert_eq!(temps(&out), vec![None, Some(2.0), Some(3.0), Some(4.0), None]);
        assert_eq!(out.filled, 1);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn missing_grid_slots_are_dropped_but_bridged_over_time() {
        // Hour 1 has no observation at all; hour 2 is null.
        let rows = vec![row(0, Some(0.0)), row(2, None), row(3, Some(3.0))];
        let out = interpolate_entity(&grid(4), rows, &[], InterpolationSettings::default());
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.empty_slots, 1);
        assert_eq!(temps(&out), vec![Some(0.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn gaps_wider_than_the_limit_stay_null() {
        let rows = vec![row(0, Some(0.0)), row(1, None), row(2, None), row(3, Some(3.0))];
        let out = interpolate_entity(&grid(4), rows, &[], InterpolationSettings { max_gap_hours: 1 });
        assert_eq!(temps(&out), vec![Some(0.0), None, None, Some(3.0)]);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn declared_metrics_are_added_and_off_grid_rows_counted() {
        let rows = vec![row(0, Some(1.0)), row(1, Some(1.0)), row(9, Some(1.0))];
        let declared = vec!["wind_speed_10m".to_string()];
        let out = interpolate_entity(&grid(2), rows, &declared, InterpolationSettings::default());
        assert_eq!(out.off_grid, 1);
        assert_eq!(out.rows.len(), 2);
        assert!(out.rows.iter().all(|r| r.metrics.get("wind_speed_10m") == Some(&None)));
    }
}
