use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use super::{
    hour::{ceil_hour, floor_hour},
    DomainError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntityKind {
    /// A weather station.
    Station,
    /// A price or generation zone.
    Zone,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Station => "station",
            EntityKind::Zone => "zone",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "station" => Ok(EntityKind::Station),
            "zone" => Ok(EntityKind::Zone),
            other => Err(DomainError::UnknownEntityKind(other.to_string())),
        }
    }
}

/// A station or zone whose hourly series is tracked independently.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Entity {
    pub entity_id: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub state: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// First hour the entity is active (inclusive). `None` means unbounded.
    pub valid_from: Option<OffsetDateTime>,
    /// Last hour the entity is active (inclusive). `None` means unbounded.
    pub valid_to: Option<OffsetDateTime>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            name: None,
            state: None,
            region: None,
            latitude: None,
            longitude: None,
            valid_from: None,
            valid_to: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_validity(mut self, from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> Self {
        self.valid_from = from;
        self.valid_to = to;
        self
    }

    /// Intersect an observed `[first, last]` hour range with the validity interval.
    ///
    /// Validity bounds are snapped inward to whole hours. Returns `None` when the
    /// two ranges do not overlap.
    pub fn active_range(
        &self,
        first: OffsetDateTime,
        last: OffsetDateTime,
    ) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let lo = match self.valid_from {
            Some(from) => first.max(ceil_hour(from)),
            None => first,
        };
        let hi = match self.valid_to {
            Some(to) => last.min(floor_hour(to)),
            None => last,
        };
        (lo <= hi).then_some((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn open_validity_keeps_observed_range() {
        let e = Entity::new("691", EntityKind::Station);
        let range = e.active_range(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC));
        assert_eq!(
            range,
            Some((datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC)))
        );
    }

    #[test]
    fn validity_clips_and_snaps_to_hours() {
        let e = Entity::new("691", EntityKind::Station).with_validity(
            Some(datetime!(2024-01-01 05:30 UTC)),
            Some(datetime!(2024-01-01 10:15 UTC)),
        );
        let range = e.active_range(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-02 00:00 UTC));
        assert_eq!(
            range,
            Some((datetime!(2024-01-01 06:00 UTC), datetime!(2024-01-01 10:00 UTC)))
        );
    }

    #[test]
    fn disjoint_validity_yields_none() {
        let e = Entity::new("DE-LU", EntityKind::Zone)
            .with_validity(None, Some(datetime!(2023-12-31 23:00 UTC)));
        assert_eq!(
            e.active_range(datetime!(2024-01-01 00:00 UTC), datetime!(2024-01-01 05:00 UTC)),
            None
        );
    }
}
