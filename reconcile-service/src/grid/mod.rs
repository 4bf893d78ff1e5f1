//! Canonical hourly grid per entity.
//!
//! The grid is a sequence of UTC instants one hour apart, so it has no holes
//! and no duplicates by construction. Each slot also records the local civil
//! time in the deployment zone and whether it sits on a DST transition:
//! both instants of a repeated autumn hour are flagged, and the first slot
//! after a skipped spring hour is flagged. A skipped local hour has no
//! instant and therefore never gets a slot.

pub mod localize;

use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use time_tz::{OffsetDateTimeExt, OffsetResult, PrimitiveDateTimeExt, Tz};

use series_client::domain::hour::floor_hour;

pub use localize::{localize_series, AmbiguousPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstMark {
    Regular,
    /// One of the two instants sharing a local wall-clock hour (autumn).
    RepeatedHour { occurrence: u8 },
    /// The first instant after a local hour that does not exist (spring).
    AfterSpringGap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSlot {
    /// UTC instant, hour aligned.
    pub ts: OffsetDateTime,
    /// Wall-clock time in the deployment zone.
    pub local: PrimitiveDateTime,
    pub mark: DstMark,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("entity {entity_id}: ambiguous local time {local} appears {occurrences} time(s); cannot assign instants")]
    UnresolvedAmbiguity {
        entity_id: String,
        local: PrimitiveDateTime,
        occurrences: usize,
    },
    #[error("entity {entity_id}: ambiguous local time {local} rejected by policy")]
    AmbiguityRejected {
        entity_id: String,
        local: PrimitiveDateTime,
    },
    #[error("entity {entity_id}: local time {local} has no valid instant within a day")]
    NoValidInstant {
        entity_id: String,
        local: PrimitiveDateTime,
    },
}

pub(crate) fn local_wall_clock(ts: OffsetDateTime, zone: &Tz) -> PrimitiveDateTime {
    let local = ts.to_timezone(zone);
    PrimitiveDateTime::new(local.date(), local.time())
}

fn mark_for(ts: OffsetDateTime, local: PrimitiveDateTime, zone: &Tz) -> DstMark {
    if let OffsetResult::Ambiguous(a, b) = local.assume_timezone(zone) {
        let occurrence = if ts == a.min(b) { 1 } else { 2 };
        return DstMark::RepeatedHour { occurrence };
    }

    let here = ts.to_timezone(zone).offset();
    let before = (ts - Duration::HOUR).to_timezone(zone).offset();
    if here.whole_seconds() > before.whole_seconds() {
        DstMark::AfterSpringGap
    } else {
        DstMark::Regular
    }
}

/// Build the grid covering `[first, last]` (inclusive) in one-hour steps.
///
/// Bounds are floored to the UTC hour. `first > last` yields an empty grid.
pub fn build_grid(first: OffsetDateTime, last: OffsetDateTime, zone: &Tz) -> Vec<GridSlot> {
    let first = floor_hour(first);
    let last = floor_hour(last);
    if first > last {
        return Vec::new();
    }

    let hours = ((last - first).whole_hours() + 1) as usize;
    let mut slots = Vec::with_capacity(hours);
    let mut ts = first;
    while ts <= last {
        let local = local_wall_clock(ts, zone);
        slots.push(GridSlot {
            ts: ts.to_offset(UtcOffset::UTC),
            local,
            mark: mark_for(ts, local, zone),
        });
        ts += Duration::HOUR;
    }
    slots
}
