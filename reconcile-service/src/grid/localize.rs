use std::collections::HashMap;

use serde::Deserialize;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use time_tz::{OffsetResult, PrimitiveDateTimeExt, Tz};

use crate::{
    normalize::{NormalizedRecord, RecordTime},
    reconcile::RawObservation,
};

use super::GridError;

/// What to do with a local wall-clock time that maps to two instants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousPolicy {
    /// First occurrence in the series → earlier instant, second → later.
    /// Any other count is an error.
    #[default]
    Sequence,
    /// A lone occurrence takes the earlier instant. Two occurrences are
    /// still assigned in delivery order.
    Earliest,
    /// A lone occurrence takes the later instant. Two occurrences are
    /// still assigned in delivery order.
    Latest,
    Reject,
}

/// Longest spring gap we search past when shifting a nonexistent local time.
const MAX_SHIFT_HOURS: i64 = 24;

enum Resolved {
    Exact(OffsetDateTime),
    Ambiguous(OffsetDateTime, OffsetDateTime),
    Shifted(OffsetDateTime),
}

fn resolve(local: PrimitiveDateTime, zone: &Tz) -> Option<Resolved> {
    match local.assume_timezone(zone) {
        OffsetResult::Some(ts) => Some(Resolved::Exact(ts)),
        OffsetResult::Ambiguous(a, b) => Some(Resolved::Ambiguous(a.min(b), a.max(b))),
        OffsetResult::None => (1..=MAX_SHIFT_HOURS).find_map(|k| {
            match (local + Duration::hours(k)).assume_timezone(zone) {
                OffsetResult::Some(ts) => Some(Resolved::Shifted(ts)),
                OffsetResult::Ambiguous(a, b) => Some(Resolved::Shifted(a.min(b))),
                OffsetResult::None => None,
            }
        }),
    }
}

/// Resolve one (provider, entity) series to UTC instants.
///
/// `records` must belong to a single provider and entity and be in the order
/// the provider delivered them; the `sequence` policy depends on that order.
/// Local times that do not exist are moved forward to the next valid hour and
/// marked `shifted_forward`. A provider's `time_shift` is applied to the
/// resolved instant, never to the wall-clock reading.
pub fn localize_series(
    entity_id: &str,
    records: Vec<NormalizedRecord>,
    zone: &Tz,
    policy: AmbiguousPolicy,
) -> Result<Vec<RawObservation>, GridError> {
    let mut totals: HashMap<PrimitiveDateTime, usize> = HashMap::new();
    for r in &records {
        if let RecordTime::Local(local) = r.time {
            *totals.entry(local).or_default() += 1;
        }
    }
    let mut seen: HashMap<PrimitiveDateTime, usize> = HashMap::new();

    let mut out = Vec::with_capacity(records.len());
    for r in records {
        let (ts, shifted_forward) = match r.time {
            RecordTime::Instant(ts) => (ts, false),
            RecordTime::Local(local) => {
                let resolved = resolve(local, zone).ok_or_else(|| GridError::NoValidInstant {
                    entity_id: entity_id.to_string(),
                    local,
                })?;
                match resolved {
                    Resolved::Exact(ts) => (ts, false),
                    Resolved::Shifted(ts) => {
                        tracing::debug!(entity_id, %local, shifted_to = %ts, "nonexistent local time shifted forward");
                        (ts, true)
                    }
                    Resolved::Ambiguous(earlier, later) => {
                        if policy == AmbiguousPolicy::Reject {
                            return Err(GridError::AmbiguityRejected {
                                entity_id: entity_id.to_string(),
                                local,
                            });
                        }
                        let occurrences = totals.get(&local).copied().unwrap_or(0);
                        let ts = match (policy, occurrences) {
                            // Both deliveries present: they are the two instants, in order.
                            (_, 2) => {
                                let nth = seen.entry(local).or_default();
                                *nth += 1;
                                if *nth == 1 {
                                    earlier
                                } else {
                                    later
                                }
                            }
                            (AmbiguousPolicy::Earliest, 1) => earlier,
                            (AmbiguousPolicy::Latest, 1) => later,
                            _ => {
                                return Err(GridError::UnresolvedAmbiguity {
                                    entity_id: entity_id.to_string(),
                                    local,
                                    occurrences,
                                })
                            }
                        };
                        (ts, false)
                    }
                }
            }
        };

        out.push(RawObservation {
            provider: r.provider,
            entity_id: r.entity_id,
            ts: (ts + r.time_shift).to_offset(UtcOffset::UTC),
            tier: r.tier,
            fetched_at: r.fetched_at,
            metrics: r.metrics,
            shifted_forward,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use series_client::{MetricMap, SourceTier};
    use time::macros::datetime;
    use time_tz::timezones;

    fn local(ts: PrimitiveDateTime, temp: f64) -> NormalizedRecord {
        NormalizedRecord {
            provider: "open_meteo_archive".to_string(),
            entity_id: "691".to_string(),
            time: RecordTime::Local(ts),
            tier: SourceTier::Archive,
            fetched_at: datetime!(2024-11-01 00:00 UTC),
            metrics: MetricMap::from([("temperature_2m".to_string(), Some(temp))]),
            time_shift: Duration::ZERO,
        }
    }

    fn autumn_series() -> Vec<NormalizedRecord> {
        vec![
            local(datetime!(2024-10-27 01:00), 1.0),
            local(datetime!(2024-10-27 02:00), 2.0),
            local(datetime!(2024-10-27 02:00), 3.0),
            local(datetime!(2024-10-27 03:00), 4.0),
        ]
    }

    #[test]
    fn sequence_assigns_repeated_hours_in_order() {
        let zone = timezones::db::europe::BERLIN;
        let out = localize_series("691", autumn_series(), zone, AmbiguousPolicy::Sequence).unwrap();
        let ts: Vec<_> = out.iter().map(|o| o.ts).collect();
        assert_eq!(
            ts,
            vec![
                datetime!(2024-10-26 23:00 UTC),
                datetime!(2024-10-27 00:00 UTC),
                datetime!(2024-10-27 01:00 UTC),
                datetime!(2024-10-27 02:00 UTC),
            ]
        );
        assert_eq!(out[1].metrics["temperature_2m"], Some(2.0));
        assert_eq!(out[2].metrics["temperature_2m"], Some(3.0));
    }

    #[test]
    fn single_occurrence_of_an_ambiguous_hour_is_an_error() {
        let zone = timezones::db::europe::BERLIN;
        let mut series = autumn_series();
        series.remove(2);
        let err = localize_series("691", series, zone, AmbiguousPolicy::Sequence).unwrap_err();
        assert!(matches!(err, GridError::UnresolvedAmbiguity { occurrences: 1, .. }));

        let latest = localize_series(
            "691",
            vec![local(datetime!(2024-10-27 02:00), 2.0)],
            zone,
            AmbiguousPolicy::Latest,
        )
        .unwrap();
        assert_eq!(latest[0].ts, datetime!(2024-10-27 01:00 UTC));

        let rejected = localize_series("691", autumn_series(), zone, AmbiguousPolicy::Reject);
        assert!(matches!(rejected, Err(GridError::AmbiguityRejected { .. })));
    }

    #[test]
    fn nonexistent_spring_hour_shifts_forward_once() {
        let zone = timezones::db::europe::BERLIN;
        let out = localize_series(
            "691",
            vec![
                local(datetime!(2024-03-31 01:00), 1.0),
                local(datetime!(2024-03-31 02:00), 2.0),
            ],
            zone,
            AmbiguousPolicy::Sequence,
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ts, datetime!(2024-03-31 00:00 UTC));
        assert!(!out[0].shifted_forward);
        assert_eq!(out[1].ts, datetime!(2024-03-31 01:00 UTC));
        assert!(out[1].shifted_forward);
    }

    #[test]
    fn earliest_and_latest_keep_both_deliveries_of_a_repeated_hour() {
        let zone = timezones::db::europe::BERLIN;
        for policy in [AmbiguousPolicy::Earliest, AmbiguousPolicy::Latest] {
            let out = localize_series("691", autumn_series(), zone, policy).unwrap();
            let ts: Vec<_> = out.iter().map(|o| o.ts).collect();
            assert_eq!(
                ts,
                vec![
                    datetime!(2024-10-26 23:00 UTC),
                    datetime!(2024-10-27 00:00 UTC),
                    datetime!(2024-10-27 01:00 UTC),
                    datetime!(2024-10-27 02:00 UTC),
                ],
                "{policy:?}"
            );
            assert_eq!(out[1].metrics["temperature_2m"], Some(2.0));
            assert_eq!(out[2].metrics["temperature_2m"], Some(3.0));
        }
    }

    #[test]
    fn earliest_applies_to_a_lone_repeated_hour() {
        let zone = timezones::db::europe::BERLIN;
        let out = localize_series(
            "691",
            vec![local(datetime!(2024-10-27 02:00), 2.0)],
            zone,
            AmbiguousPolicy::Earliest,
        )
        .unwrap();
        assert_eq!(out[0].ts, datetime!(2024-10-27 00:00 UTC));

        let mut tripled = autumn_series();
        tripled.push(local(datetime!(2024-10-27 02:00), 9.0));
        let err = localize_series("691", tripled, zone, AmbiguousPolicy::Latest).unwrap_err();
        assert!(matches!(err, GridError::UnresolvedAmbiguity { occurrences: 3, .. }));
    }

    #[test]
    fn shift_applies_after_resolution() {
        let zone = timezones::db::europe::BERLIN;
        // Labelled by interval end: 03:00 CEST (01:00 UTC) closes the hour from 00:00 UTC.
        let mut record = local(datetime!(2024-03-31 03:00), 3.0);
        record.time_shift = -Duration::HOUR;
        let out = localize_series("691", vec![record], zone, AmbiguousPolicy::Sequence).unwrap();
        assert_eq!(out[0].ts, datetime!(2024-03-31 00:00 UTC));
        assert!(!out[0].shifted_forward);
    }
}
