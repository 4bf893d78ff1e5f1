//! Source normalization: provider record shapes → one canonical record form.
//!
//! Each provider is described by a [`ProviderProfile`]. The profile names the
//! fields carrying the entity id and timestamp, maps provider metric labels to
//! the shared vocabulary and lists sentinel values that mean "no data".
//! Fields the profile does not mention are ignored.

pub mod number;

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use series_client::{domain::hour::is_hour_aligned, MetricMap, SourceTier};
use time::{
    format_description::{self, well_known::Rfc3339},
    Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

use crate::{
    config::ConfigError,
    pipeline::Envelope,
    resample::HourlyResample,
    sources::{FieldValue, ProviderRecord},
};

use number::{coerce, Coerced};

/// How a provider encodes its timestamps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampFormat {
    /// RFC 3339 with an explicit offset.
    Rfc3339,
    /// Seconds since the unix epoch, UTC.
    UnixSeconds,
    /// Naive wall-clock time in the deployment time zone, parsed with a
    /// `time` format description such as `[year]-[month]-[day]T[hour]:[minute]`.
    Local { format: String },
}

fn default_entity_field() -> String {
    "entity_id".to_string()
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_thousands() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub tier: SourceTier,
    #[serde(default = "default_entity_field")]
    pub entity_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    pub timestamp: TimestampFormat,
    /// Optional RFC 3339 field overriding the envelope's receive time.
    #[serde(default)]
    pub fetched_at_field: Option<String>,
    /// Provider label → shared metric name.
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
    #[serde(default)]
    pub sentinels: Vec<f64>,
    /// Thousands separator inside string-encoded numbers; empty disables stripping.
    #[serde(default = "default_thousands")]
    pub thousands_separator: String,
    /// Added to every timestamp after zone resolution, e.g. `-1` for feeds
    /// labelled by interval end.
    #[serde(default)]
    pub time_shift_hours: i64,
    /// Sub-hourly feeds are aggregated to whole hours when set; otherwise
    /// timestamps off the hour are rejected.
    #[serde(default)]
    pub resample: Option<HourlyResample>,
    /// Shared metric → shared metrics summed into it, per record.
    #[serde(default)]
    pub derived: BTreeMap<String, Vec<String>>,
}

impl ProviderProfile {
    pub fn thousands(&self) -> Option<char> {
        self.thousands_separator.chars().next()
    }

    pub fn time_shift(&self) -> Duration {
        Duration::hours(self.time_shift_hours)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("no profile registered for provider '{0}'")]
    UnknownProvider(String),
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("timestamp {0} is not aligned to a whole hour")]
    Misaligned(String),
    #[error("invalid fetched-at value '{value}': {reason}")]
    InvalidFetchedAt { value: String, reason: String },
}

/// Timestamp of a normalized record before time-zone resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTime {
    Instant(OffsetDateTime),
    /// Wall-clock time that still has to be resolved against the deployment zone.
    Local(PrimitiveDateTime),
}

impl std::fmt::Display for RecordTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordTime::Instant(ts) => write!(f, "{ts}"),
            RecordTime::Local(local) => write!(f, "{local}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub provider: String,
    pub entity_id: String,
    pub time: RecordTime,
    pub tier: SourceTier,
    pub fetched_at: OffsetDateTime,
    pub metrics: MetricMap,
    /// Applied to the instant once `time` is resolved.
    pub time_shift: Duration,
}

#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<NormalizedRecord>,
    pub rejected: usize,
}

pub struct Normalizer {
    profiles: HashMap<String, ProviderProfile>,
}

impl Normalizer {
    pub fn new(profiles: Vec<ProviderProfile>) -> Result<Self, ConfigError> {
        let mut by_name = HashMap::with_capacity(profiles.len());
        for profile in profiles {
            if let TimestampFormat::Local { format } = &profile.timestamp {
                format_description::parse(format).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "provider '{}': bad timestamp format '{format}': {e}",
                        profile.name
                    ))
                })?;
            }
            for (target, inputs) in &profile.derived {
                if let Some(unknown) = inputs.iter().find(|i| !profile.metrics.values().any(|m| m == *i)) {
                    return Err(ConfigError::Invalid(format!(
                        "provider '{}': derived '{target}' sums unmapped metric '{unknown}'",
                        profile.name
                    )));
                }
            }
            if by_name.contains_key(&profile.name) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' is declared twice",
                    profile.name
                )));
            }
            by_name.insert(profile.name.clone(), profile);
        }
        Ok(Self { profiles: by_name })
    }

    pub fn profile(&self, provider: &str) -> Option<&ProviderProfile> {
        self.profiles.get(provider)
    }

    pub fn normalize(&self, env: &Envelope<ProviderRecord>) -> Result<NormalizedRecord, NormalizationError> {
        let record = &env.payload;
        let profile = self
            .profiles
            .get(&record.provider)
            .ok_or_else(|| NormalizationError::UnknownProvider(record.provider.clone()))?;

        let entity_id = match record.fields.get(&profile.entity_field) {
            Some(FieldValue::Text(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(FieldValue::Number(n)) if n.is_finite() => entity_id_from_number(*n),
            _ => return Err(NormalizationError::MissingField(profile.entity_field.clone())),
        };

        let raw_ts = record
            .fields
            .get(&profile.timestamp_field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| NormalizationError::MissingField(profile.timestamp_field.clone()))?;

        let time = match parse_time(raw_ts, &profile.timestamp)? {
            RecordTime::Instant(ts) => RecordTime::Instant(ts.to_offset(UtcOffset::UTC)),
            local @ RecordTime::Local(_) => local,
        };
        if profile.resample.is_none() {
            let aligned = match time {
                RecordTime::Instant(ts) => is_hour_aligned(ts),
                RecordTime::Local(local) => local.minute() == 0 && local.second() == 0 && local.nanosecond() == 0,
            };
            if !aligned {
                return Err(NormalizationError::Misaligned(time.to_string()));
            }
        }

        let fetched_at = match profile.fetched_at_field.as_ref().and_then(|f| record.fields.get(f)) {
            None | Some(FieldValue::Null) => OffsetDateTime::from(env.received_at),
            Some(FieldValue::Text(s)) => OffsetDateTime::parse(s.trim(), &Rfc3339).map_err(|e| {
                NormalizationError::InvalidFetchedAt {
                    value: s.clone(),
                    reason: e.to_string(),
                }
            })?,
            Some(other) => {
                return Err(NormalizationError::InvalidFetchedAt {
                    value: format!("{other:?}"),
                    reason: "expected an RFC 3339 string".to_string(),
                })
            }
        }
        .to_offset(UtcOffset::UTC);

        let thousands = profile.thousands();
        let mut metrics = MetricMap::new();
        for (label, canonical) in &profile.metrics {
            let value = record.fields.get(label).unwrap_or(&FieldValue::Null);
            let v = match coerce(value, thousands, &profile.sentinels) {
                Coerced::Value(v) => Some(v),
                Coerced::Missing => None,
                Coerced::Garbage => {
                    metrics::counter!("normalize_unparseable_values_total").increment(1);
                    None
                }
            };
            // Several labels may feed one shared name; a delivered value wins over a gap.
            match metrics.get(canonical) {
                Some(Some(_)) if v.is_none() => {}
                _ => {
                    metrics.insert(canonical.clone(), v);
                }
            }
        }
        for (target, inputs) in &profile.derived {
            metrics.insert(target.clone(), derived_sum(&metrics, inputs));
        }

        Ok(NormalizedRecord {
            provider: record.provider.clone(),
            entity_id,
            time,
            tier: profile.tier,
            fetched_at,
            metrics,
            time_shift: profile.time_shift(),
        })
    }

    /// Normalize a whole batch. Bad records are logged, counted and dropped.
    pub fn normalize_batch(&self, batch: Vec<Envelope<ProviderRecord>>) -> NormalizeOutcome {
        let mut out = NormalizeOutcome {
            records: Vec::with_capacity(batch.len()),
            rejected: 0,
        };

        for env in batch {
            match self.normalize(&env) {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    tracing::warn!(
                        provider = %env.payload.provider,
                        error = %e,
                        "dropping provider record"
                    );
                    metrics::counter!("normalize_rejected_total").increment(1);
                    out.rejected += 1;
                }
            }
        }

        metrics::counter!("normalize_accepted_total").increment(out.records.len() as u64);
        out
    }
}

/// Sum of the present inputs; null when none is present.
fn derived_sum(metrics: &MetricMap, inputs: &[String]) -> Option<f64> {
    let present: Vec<f64> = inputs.iter().filter_map(|m| metrics.get(m).copied().flatten()).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum())
    }
}

fn entity_id_from_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn parse_time(raw: &FieldValue, format: &TimestampFormat) -> Result<RecordTime, NormalizationError> {
    let invalid = |value: String, reason: String| NormalizationError::InvalidTimestamp { value, reason };

    match (format, raw) {
        (TimestampFormat::Rfc3339, FieldValue::Text(s)) => OffsetDateTime::parse(s.trim(), &Rfc3339)
            .map(RecordTime::Instant)
            .map_err(|e| invalid(s.clone(), e.to_string())),
        (TimestampFormat::UnixSeconds, FieldValue::Number(n)) => {
            if n.fract() != 0.0 {
                return Err(invalid(n.to_string(), "fractional unix seconds".to_string()));
            }
            OffsetDateTime::from_unix_timestamp(*n as i64)
                .map(RecordTime::Instant)
                .map_err(|e| invalid(n.to_string(), e.to_string()))
        }
        (TimestampFormat::UnixSeconds, FieldValue::Text(s)) => {
            let secs: i64 = s
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(s.clone(), e.to_string()))?;
            OffsetDateTime::from_unix_timestamp(secs)
                .map(RecordTime::Instant)
                .map_err(|e| invalid(s.clone(), e.to_string()))
        }
        (TimestampFormat::Local { format }, FieldValue::Text(s)) => {
            let items = format_description::parse(format).map_err(|e| invalid(s.clone(), e.to_string()))?;
            PrimitiveDateTime::parse(s.trim(), &items)
                .map(RecordTime::Local)
                .map_err(|e| invalid(s.clone(), e.to_string()))
        }
        (_, other) => Err(invalid(format!("{other:?}"), "unexpected value type".to_string())),
    }
}
