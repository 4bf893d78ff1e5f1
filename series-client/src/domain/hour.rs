//! Hour arithmetic on UTC instants.

use time::{Duration, OffsetDateTime, UtcOffset};

pub fn is_hour_aligned(ts: OffsetDateTime) -> bool {
    ts.unix_timestamp().rem_euclid(3600) == 0 && ts.nanosecond() == 0
}

/// Truncate to the start of the UTC hour containing `ts`.
pub fn floor_hour(ts: OffsetDateTime) -> OffsetDateTime {
    let secs = ts.unix_timestamp().rem_euclid(3600);
    (ts - Duration::seconds(secs) - Duration::nanoseconds(i64::from(ts.nanosecond())))
        .to_offset(UtcOffset::UTC)
}

pub fn ceil_hour(ts: OffsetDateTime) -> OffsetDateTime {
    if is_hour_aligned(ts) {
        ts.to_offset(UtcOffset::UTC)
    } else {
        floor_hour(ts) + Duration::HOUR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn floor_and_ceil_work_on_utc_hours() {
        let ts = datetime!(2024-03-31 01:30:15 +01:00);
        assert_eq!(floor_hour(ts), datetime!(2024-03-31 00:00:00 UTC));
        assert_eq!(ceil_hour(ts), datetime!(2024-03-31 01:00:00 UTC));
        assert!(!is_hour_aligned(ts));
    }

    #[test]
    fn aligned_instants_are_left_alone() {
        let ts = datetime!(2024-10-27 02:00:00 +02:00);
        assert!(is_hour_aligned(ts));
        assert_eq!(floor_hour(ts), ts);
        assert_eq!(ceil_hour(ts), ts);
        assert_eq!(floor_hour(ts).offset(), UtcOffset::UTC);
    }
}
