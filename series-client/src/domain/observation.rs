use std::collections::BTreeMap;

use time::OffsetDateTime;

use super::SourceTier;

/// Metric name → value. `None` marks a value the provider did not deliver.
///
/// Ordered so that iteration, hashing and SQL column order are deterministic.
pub type MetricMap = BTreeMap<String, Option<f64>>;

/// Unique key of one hourly observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub entity_id: String,
    pub ts: OffsetDateTime,
}

impl SeriesKey {
    pub fn new(entity_id: impl Into<String>, ts: OffsetDateTime) -> Self {
        Self {
            entity_id: entity_id.into(),
            ts,
        }
    }
}

/// One row of the canonical hourly store.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanonicalRow {
    pub entity_id: String,
    pub ts: OffsetDateTime,
    pub source_tier: SourceTier,
    pub fetched_at: OffsetDateTime,
    pub metrics: MetricMap,
}

impl CanonicalRow {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.entity_id.clone(), self.ts)
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    /// True when tier and every metric in `columns` match `other`.
    ///
    /// Fetch time is ignored: a re-fetch that delivers the same values is not a change.
    pub fn same_content(&self, other: &CanonicalRow, columns: &[String]) -> bool {
        self.source_tier == other.source_tier
            && columns
                .iter()
                .all(|c| same_value(self.metric(c), other.metric(c)))
    }
}

fn same_value(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn row(temp: Option<f64>, tier: SourceTier) -> CanonicalRow {
        CanonicalRow {
            entity_id: "E1".to_string(),
            ts: datetime!(2024-01-01 02:00 UTC),
            source_tier: tier,
            fetched_at: datetime!(2024-01-03 00:00 UTC),
            metrics: MetricMap::from([("temperature_2m".to_string(), temp)]),
        }
    }

    #[test]
    fn same_content_ignores_fetch_time_but_not_values() {
        let cols = vec!["temperature_2m".to_string(), "precipitation".to_string()];
        let a = row(Some(5.0), SourceTier::Archive);
        let mut b = a.clone();
        b.fetched_at = datetime!(2024-01-04 00:00 UTC);
        assert!(a.same_content(&b, &cols));

        assert!(!a.same_content(&row(Some(5.5), SourceTier::Archive), &cols));
        assert!(!a.same_content(&row(None, SourceTier::Archive), &cols));
        assert!(!a.same_content(&row(Some(5.0), SourceTier::Forecast), &cols));
    }

    #[test]
    fn missing_metric_reads_as_none() {
        let r = row(Some(1.0), SourceTier::Archive);
        assert_eq!(r.metric("temperature_2m"), Some(1.0));
        assert_eq!(r.metric("cloud_cover"), None);
    }
}
