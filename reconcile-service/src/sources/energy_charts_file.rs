use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use futures::Stream;
use serde::Deserialize;

use crate::pipeline::{Envelope, Source, SourceError};

use super::{file_received_at, FieldValue, ProviderRecord};

#[derive(Debug, Deserialize)]
struct ProductionType {
    name: String,
    data: Vec<serde_json::Value>,
}

/// Energy-Charts style payload: a shared `unix_seconds` axis plus parallel
/// value arrays, either nested under `production_types` or at top level
/// (e.g. `price`). Non-array members such as `unit` are ignored.
#[derive(Debug, Deserialize)]
struct Payload {
    unix_seconds: Vec<i64>,
    #[serde(default)]
    production_types: Vec<ProductionType>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

/// Source for one zone's Energy-Charts payload.
///
/// Records carry `entity_id` (the configured zone), `unix_seconds` and one
/// field per series name.
pub struct EnergyChartsFileSource {
    provider: String,
    path: PathBuf,
    entity_id: String,
}

impl EnergyChartsFileSource {
    pub fn new<P: AsRef<Path>>(provider: &str, path: P, entity_id: String) -> Self {
        Self {
            provider: provider.to_string(),
            path: path.as_ref().to_path_buf(),
            entity_id,
        }
    }
}

fn series_of(payload: Payload) -> Result<(Vec<i64>, Vec<(String, Vec<serde_json::Value>)>), SourceError> {
    let n = payload.unix_seconds.len();
    let mut series: Vec<(String, Vec<serde_json::Value>)> = Vec::new();

    for pt in payload.production_types {
        if pt.data.len() != n {
            return Err(SourceError(format!(
                "series '{}' has {} values, unix_seconds has {n}",
                pt.name,
                pt.data.len()
            )));
        }
        series.push((pt.name, pt.data));
    }

    for (name, value) in payload.other {
        if let serde_json::Value::Array(values) = value {
            if values.len() == n {
                series.push((name, values));
            } else {
                tracing::debug!(field = %name, "ignoring array that does not match unix_seconds");
            }
        }
    }

    Ok((payload.unix_seconds, series))
}

#[async_trait::async_trait]
impl Source<ProviderRecord> for EnergyChartsFileSource {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<ProviderRecord>, SourceError>> + Send>> {
        let path = self.path.clone();
        let provider = self.provider.clone();
        let entity_id = self.entity_id.clone();
        let s = async_stream::try_stream! {
            let received_at = file_received_at(&path);
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SourceError(format!("failed to read {}: {e}", path.display())))?;
            let payload: Payload = serde_json::from_str(&raw)
                .map_err(|e| SourceError(format!("invalid Energy-Charts payload {}: {e}", path.display())))?;
            let (axis, series) = series_of(payload)?;

            for (i, secs) in axis.iter().enumerate() {
                let mut fields = BTreeMap::new();
                fields.insert("entity_id".to_string(), FieldValue::Text(entity_id.clone()));
                fields.insert("unix_seconds".to_string(), FieldValue::Number(*secs as f64));
                for (name, values) in &series {
                    fields.insert(name.clone(), FieldValue::from_json(&values[i]));
                }

                yield Envelope {
                    payload: ProviderRecord {
                        provider: provider.clone(),
                        fields,
                    },
                    received_at,
                };
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io::Write;

    #[tokio::test]
    async fn flattens_production_types_and_top_level_series() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "unix_seconds": [1704067200, 1704070800],
                "production_types": [
                    {{"name": "Solar", "data": [0.0, null]}},
                    {{"name": "Wind onshore", "data": [12000.5, 11800.0]}}
                ],
                "price": [80.1, 75.3],
                "unit": "EUR / MWh",
                "deprecated": false
            }}"#
        )
        .unwrap();

        let source = EnergyChartsFileSource::new("energy_charts", file.path(), "DE".to_string());
        let records: Vec<_> = source.stream().await.try_collect().await.unwrap();

        assert_eq!(records.len(), 2);
        let second = &records[1].payload.fields;
        assert_eq!(second.get("entity_id"), Some(&FieldValue::Text("DE".to_string())));
        assert_eq!(second.get("unix_seconds"), Some(&FieldValue::Number(1_704_070_800.0)));
        assert_eq!(second.get("Solar"), Some(&FieldValue::Null));
        assert_eq!(second.get("Wind onshore"), Some(&FieldValue::Number(11800.0)));
        assert_eq!(second.get("price"), Some(&FieldValue::Number(75.3)));
        assert!(!second.contains_key("unit"));
    }
}
