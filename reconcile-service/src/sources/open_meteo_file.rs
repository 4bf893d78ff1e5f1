use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use futures::Stream;
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::pipeline::{Envelope, Source, SourceError};

use super::{file_received_at, FieldValue, ProviderRecord};

/// One station's hourly block as stored by the fetch layer.
///
/// `hourly.time` holds naive local timestamps; every other `hourly` key is a
/// variable column of the same length.
#[derive(Debug, Deserialize)]
struct StationPayload {
    entity_id: String,
    #[serde(default)]
    fetched_at: Option<String>,
    hourly: BTreeMap<String, Vec<serde_json::Value>>,
}

/// Source for Open-Meteo style payloads: a JSON array of per-station blocks.
///
/// Each hour becomes one record with fields `entity_id`, `time` and one field
/// per hourly variable.
pub struct OpenMeteoFileSource {
    provider: String,
    path: PathBuf,
}

impl OpenMeteoFileSource {
    pub fn new<P: AsRef<Path>>(provider: &str, path: P) -> Self {
        Self {
            provider: provider.to_string(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

fn expand_station(
    provider: &str,
    station: StationPayload,
    file_time: SystemTime,
) -> Result<Vec<Envelope<ProviderRecord>>, SourceError> {
    let times = station
        .hourly
        .get("time")
        .ok_or_else(|| SourceError(format!("station {}: payload has no hourly.time", station.entity_id)))?;

    for (name, column) in &station.hourly {
        if column.len() != times.len() {
            return Err(SourceError(format!(
                "station {}: hourly.{name} has {} values, hourly.time has {}",
                station.entity_id,
                column.len(),
                times.len()
            )));
        }
    }

    let received_at = match &station.fetched_at {
        Some(s) => OffsetDateTime::parse(s, &Rfc3339)
            .map(SystemTime::from)
            .map_err(|e| SourceError(format!("station {}: bad fetched_at '{s}': {e}", station.entity_id)))?,
        None => file_time,
    };

    let records = (0..times.len())
        .map(|i| {
            let mut fields: BTreeMap<String, FieldValue> = station
                .hourly
                .iter()
                .map(|(name, column)| (name.clone(), FieldValue::from_json(&column[i])))
                .collect();
            fields.insert("entity_id".to_string(), FieldValue::Text(station.entity_id.clone()));
            Envelope {
                payload: ProviderRecord {
                    provider: provider.to_string(),
                    fields,
                },
                received_at,
            }
        })
        .collect();

    Ok(records)
}

#[async_trait::async_trait]
impl Source<ProviderRecord> for OpenMeteoFileSource {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<ProviderRecord>, SourceError>> + Send>> {
        let path = self.path.clone();
        let provider = self.provider.clone();
        let s = async_stream::try_stream! {
            let file_time = file_received_at(&path);
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SourceError(format!("failed to read {}: {e}", path.display())))?;
            let stations: Vec<StationPayload> = serde_json::from_str(&raw)
                .map_err(|e| SourceError(format!("invalid Open-Meteo payload {}: {e}", path.display())))?;

            for station in stations {
                for env in expand_station(&provider, station, file_time)? {
                    yield env;
                }
            }
        };

        Box::pin(s)
    }
}
