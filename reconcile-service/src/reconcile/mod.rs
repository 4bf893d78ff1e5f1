//! Priority reconciliation: one authoritative record per (entity, hour).
//!
//! Candidates for the same key are ranked by a total order so the result does
//! not depend on the order in which providers delivered them:
//!
//! 1. tier rank from [`TierPriority`],
//! 2. latest `fetched_at`,
//! 3. a record at its own reported time beats one shifted out of a spring gap,
//! 4. provider name,
//! 5. a blake3 digest of the record content.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::Deserialize;
use series_client::{CanonicalRow, MetricMap, SourceTier};
use time::OffsetDateTime;

use crate::config::ConfigError;

/// Tier precedence, highest trust first. Lists every tier exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<SourceTier>")]
pub struct TierPriority {
    order: Vec<SourceTier>,
}

impl TierPriority {
    pub fn new(order: Vec<SourceTier>) -> Result<Self, ConfigError> {
        for tier in SourceTier::ALL {
            let n = order.iter().filter(|t| **t == tier).count();
            if n != 1 {
                return Err(ConfigError::Invalid(format!(
                    "tier_priority must list '{tier}' exactly once (found {n})"
                )));
            }
        }
        if order.len() != SourceTier::ALL.len() {
            return Err(ConfigError::Invalid("tier_priority has extra entries".to_string()));
        }
        Ok(Self { order })
    }

    /// Larger is more trusted.
    pub fn rank(&self, tier: SourceTier) -> usize {
        self.order
            .iter()
            .position(|t| *t == tier)
            .map_or(0, |i| self.order.len() - i)
    }

    pub fn order(&self) -> &[SourceTier] {
        &self.order
    }

    pub fn outranks(&self, a: SourceTier, b: SourceTier) -> bool {
        self.rank(a) > self.rank(b)
    }
}

impl Default for TierPriority {
    fn default() -> Self {
        Self {
            order: vec![SourceTier::Correction, SourceTier::Archive, SourceTier::Forecast],
        }
    }
}

impl TryFrom<Vec<SourceTier>> for TierPriority {
    type Error = ConfigError;

    fn try_from(order: Vec<SourceTier>) -> Result<Self, Self::Error> {
        TierPriority::new(order)
    }
}

/// One localized provider record, keyed to a UTC hour.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub provider: String,
    pub entity_id: String,
    pub ts: OffsetDateTime,
    pub tier: SourceTier,
    pub fetched_at: OffsetDateTime,
    pub metrics: MetricMap,
    /// The reported local time did not exist and was moved forward.
    pub shifted_forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledObservation {
    pub entity_id: String,
    pub ts: OffsetDateTime,
    pub tier: SourceTier,
    pub fetched_at: OffsetDateTime,
    pub metrics: MetricMap,
}

impl From<ReconciledObservation> for CanonicalRow {
    fn from(o: ReconciledObservation) -> Self {
        CanonicalRow {
            entity_id: o.entity_id,
            ts: o.ts,
            source_tier: o.tier,
            fetched_at: o.fetched_at,
            metrics: o.metrics,
        }
    }
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_opt_f64(hasher: &mut blake3::Hasher, v: Option<f64>) {
    match v {
        Some(x) => {
            hasher.update(&[1]);
            hasher.update(&x.to_bits().to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

/// Content digest used as the last tiebreak between otherwise equal candidates.
pub fn content_digest(o: &RawObservation) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, &o.provider);
    hash_str(&mut h, &o.entity_id);
    h.update(&o.ts.unix_timestamp_nanos().to_le_bytes());
    hash_str(&mut h, o.tier.as_str());
    h.update(&o.fetched_at.unix_timestamp_nanos().to_le_bytes());
    h.update(&[u8::from(o.shifted_forward)]);
    for (name, value) in &o.metrics {
        hash_str(&mut h, name);
        hash_opt_f64(&mut h, *value);
    }
    *h.finalize().as_bytes()
}

/// Order two candidates for the same key; `Greater` means `a` wins.
pub fn compare_candidates(a: &RawObservation, b: &RawObservation, priority: &TierPriority) -> Ordering {
    priority
        .rank(a.tier)
        .cmp(&priority.rank(b.tier))
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
        .then_with(|| b.shifted_forward.cmp(&a.shifted_forward))
        .then_with(|| a.provider.cmp(&b.provider))
        .then_with(|| content_digest(a).cmp(&content_digest(b)))
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Sorted by timestamp, one per hour.
    pub observations: Vec<ReconciledObservation>,
    pub candidates: usize,
    /// Candidates that lost to a better record for the same hour.
    pub superseded: usize,
}

/// Collapse all observations of one entity to one record per hour.
pub fn reconcile_entity(observations: Vec<RawObservation>, priority: &TierPriority) -> ReconcileOutcome {
    let candidates = observations.len();
    let mut groups: BTreeMap<OffsetDateTime, Vec<RawObservation>> = BTreeMap::new();
    for o in observations {
        groups.entry(o.ts).or_default().push(o);
    }

    let mut out = ReconcileOutcome {
        observations: Vec::with_capacity(groups.len()),
        candidates,
        superseded: 0,
    };

    for (_, group) in groups {
        out.superseded += group.len().saturating_sub(1);
        let Some(best) = group.into_iter().max_by(|a, b| compare_candidates(a, b, priority)) else {
            continue;
        };
        out.observations.push(ReconciledObservation {
            entity_id: best.entity_id,
            ts: best.ts,
            tier: best.tier,
            fetched_at: best.fetched_at,
            metrics: best.metrics,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn obs(provider: &str, tier: SourceTier, fetched_at: OffsetDateTime, temp: f64) -> RawObservation {
        RawObservation {
            provider: provider.to_string(),
            entity_id: "E1".to_string(),
            ts: datetime!(2024-01-01 02:00 UTC),
            tier,
            fetched_at,
            metrics: MetricMap::from([("temp".to_string(), Some(temp))]),
            shifted_forward: false,
        }
    }

    #[test]
    fn higher_tier_wins_regardless_of_input_order() {
        let archive = obs("archive", SourceTier::Archive, datetime!(2024-01-02 00:00 UTC), 5.0);
        let forecast = obs("forecast", SourceTier::Forecast, datetime!(2024-01-05 00:00 UTC), 5.5);
        let priority = TierPriority::default();

        for input in [
            vec![archive.clone(), forecast.clone()],
            vec![forecast.clone(), archive.clone()],
        ] {
            let out = reconcile_entity(input, &priority);
            assert_eq!(out.observations.len(), 1);
            assert_eq!(out.observations[0].metrics["temp"], Some(5.0));
            assert_eq!(out.observations[0].tier, SourceTier::Archive);
            assert_eq!(out.superseded, 1);
        }
    }

    #[test]
    fn same_tier_prefers_latest_fetch_then_unshifted() {
        let old = obs("a", SourceTier::Archive, datetime!(2024-01-02 00:00 UTC), 1.0);
        let new = obs("a", SourceTier::Archive, datetime!(2024-01-03 00:00 UTC), 2.0);
        let out = reconcile_entity(vec![new.clone(), old], &TierPriority::default());
        assert_eq!(out.observations[0].metrics["temp"], Some(2.0));

        let mut shifted = new.clone();
        shifted.shifted_forward = true;
        shifted.metrics.insert("temp".to_string(), Some(9.0));
        let out = reconcile_entity(vec![shifted, new], &TierPriority::default());
        assert_eq!(out.observations[0].metrics["temp"], Some(2.0));
    }

    #[test]
    fn full_ties_are_broken_deterministically() {
        let ts = datetime!(2024-01-02 00:00 UTC);
        let a = obs("p", SourceTier::Archive, ts, 1.0);
        let b = obs("p", SourceTier::Archive, ts, 2.0);
        let first = reconcile_entity(vec![a.clone(), b.clone()], &TierPriority::default());
        let second = reconcile_entity(vec![b, a], &TierPriority::default());
        assert_eq!(first.observations, second.observations);
    }

    #[test]
    fn custom_priority_changes_the_winner() {
        let priority =
            TierPriority::new(vec![SourceTier::Forecast, SourceTier::Correction, SourceTier::Archive]).unwrap();
        let archive = obs("archive", SourceTier::Archive, datetime!(2024-01-02 00:00 UTC), 5.0);
        let forecast = obs("forecast", SourceTier::Forecast, datetime!(2024-01-01 00:00 UTC), 5.5);
        let out = reconcile_entity(vec![archive, forecast], &priority);
        assert_eq!(out.observations[0].metrics["temp"], Some(5.5));
    }

    #[test]
    fn incomplete_priority_lists_are_rejected() {
        assert!(TierPriority::new(vec![SourceTier::Archive, SourceTier::Forecast]).is_err());
        assert!(TierPriority::new(vec![
            SourceTier::Archive,
            SourceTier::Archive,
            SourceTier::Forecast,
            SourceTier::Correction
        ])
        .is_err());
    }

    #[test]
    fn empty_input_produces_nothing() {
        let out = reconcile_entity(Vec::new(), &TierPriority::default());
        assert!(out.observations.is_empty());
        assert_eq!(out.candidates, 0);
    }
}
