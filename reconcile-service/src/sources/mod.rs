//! File-backed provider sources.
//!
//! The network fetch layer is an external collaborator: it writes provider
//! payloads to disk, and these sources turn them into [`ProviderRecord`]s.

pub mod csv_file;
pub mod energy_charts_file;
pub mod entity_csv_file;
pub mod open_meteo_file;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use serde::Deserialize;

use crate::pipeline::{Source, SourceError};

pub use csv_file::ProviderCsvFileSource;
pub use energy_charts_file::EnergyChartsFileSource;
pub use entity_csv_file::load_entities_csv;
pub use open_meteo_file::OpenMeteoFileSource;

/// A single provider value before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Number(n) => n.as_f64().map_or(FieldValue::Null, FieldValue::Number),
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            _ => FieldValue::Null,
        }
    }
}

/// One record exactly as a provider reported it, tagged with the provider name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub provider: String,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Csv,
    OpenMeteoJson,
    EnergyChartsJson,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub format: PayloadFormat,
    pub path: PathBuf,
    /// Entity the payload belongs to, for formats that do not carry one.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub delimiter: Option<char>,
}

/// Build the source for one configured provider.
pub fn open_source(provider: &str, cfg: &SourceConfig) -> Result<Arc<dyn Source<ProviderRecord>>, SourceError> {
    let source: Arc<dyn Source<ProviderRecord>> = match cfg.format {
        PayloadFormat::Csv => {
            let delimiter = cfg.delimiter.unwrap_or(',');
            if !delimiter.is_ascii() {
                return Err(SourceError(format!("provider '{provider}': delimiter must be ASCII")));
            }
            Arc::new(ProviderCsvFileSource::new(provider, &cfg.path).with_delimiter(delimiter as u8))
        }
        PayloadFormat::OpenMeteoJson => Arc::new(OpenMeteoFileSource::new(provider, &cfg.path)),
        PayloadFormat::EnergyChartsJson => {
            let entity_id = cfg.entity_id.clone().ok_or_else(|| {
                SourceError(format!("provider '{provider}': energy_charts_json needs source.entity_id"))
            })?;
            Arc::new(EnergyChartsFileSource::new(provider, &cfg.path, entity_id))
        }
    };
    Ok(source)
}

/// Receive time for records read from `path`: the file's modification time.
pub(crate) fn file_received_at(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now())
}
