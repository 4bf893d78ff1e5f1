//! Hourly aggregation of sub-hourly provider series.
//!
//! Runs per (provider, entity) series after zone resolution, so every sample
//! is bucketed by the UTC hour it falls in and DST days need no special case.

use std::collections::BTreeMap;

use serde::Deserialize;
use series_client::{domain::hour::floor_hour, MetricMap};
use time::OffsetDateTime;

use crate::{reconcile::RawObservation, rollup::AggFn};

fn default_agg() -> AggFn {
    AggFn::Mean
}

/// Per-metric aggregation used to fold samples into their hour.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HourlyResample {
    /// Applied to metrics without an entry in `metrics`.
    #[serde(default = "default_agg")]
    pub default: AggFn,
    #[serde(default)]
    pub metrics: BTreeMap<String, AggFn>,
}

impl Default for HourlyResample {
    fn default() -> Self {
        Self {
            default: default_agg(),
            metrics: BTreeMap::new(),
        }
    }
}

impl HourlyResample {
    pub fn agg_for(&self, metric: &str) -> AggFn {
        self.metrics.get(metric).copied().unwrap_or(self.default)
    }
}

/// Fold one provider's observations into one observation per UTC hour.
///
/// Nulls are ignored; a metric with no value in the hour stays null. The
/// bucket keeps the latest `fetched_at` and counts as shifted only when
/// every sample in it was.
pub fn resample_hourly(observations: Vec<RawObservation>, plan: &HourlyResample) -> Vec<RawObservation> {
    let mut buckets: BTreeMap<OffsetDateTime, Vec<RawObservation>> = BTreeMap::new();
    for o in observations {
        buckets.entry(floor_hour(o.ts)).or_default().push(o);
    }

    buckets
        .into_iter()
        .filter_map(|(hour, samples)| {
            let mut names: Vec<&String> = samples.iter().flat_map(|s| s.metrics.keys()).collect();
            names.sort();
            names.dedup();

            let metrics: MetricMap = names
                .into_iter()
                .map(|name| {
                    let present: Vec<f64> = samples
                        .iter()
                        .filter_map(|s| s.metrics.get(name).copied().flatten())
                        .collect();
                    (name.clone(), plan.agg_for(name).apply(&present))
                })
                .collect();

            let fetched_at = samples.iter().map(|s| s.fetched_at).max()?;
            let shifted_forward = samples.iter().all(|s| s.shifted_forward);
            let first = samples.into_iter().next()?;
            Some(RawObservation {
                ts: hour,
                fetched_at,
                metrics,
                shifted_forward,
                ..first
            })
        })
        .collect()
}
