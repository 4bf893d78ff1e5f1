use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use csv::StringRecord;
use futures::Stream;

use crate::pipeline::{Envelope, Source, SourceError};

use super::{file_received_at, FieldValue, ProviderRecord};

/// Delimited-text source for one provider.
///
/// Every column becomes a text field keyed by its header name; empty cells
/// become [`FieldValue::Null`]. Interpreting the fields is left to the
/// provider's normalization profile.
pub struct ProviderCsvFileSource {
    provider: String,
    path: PathBuf,
    delimiter: u8,
}

impl ProviderCsvFileSource {
    pub fn new<P: AsRef<Path>>(provider: &str, path: P) -> Self {
        Self {
            provider: provider.to_string(),
            path: path.as_ref().to_path_buf(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

fn record_to_fields(record: &StringRecord, headers: &StringRecord) -> BTreeMap<String, FieldValue> {
    headers
        .iter()
        .zip(record.iter())
        .map(|(h, v)| {
            let trimmed = v.trim();
            let value = if trimmed.is_empty() {
                FieldValue::Null
            } else {
                FieldValue::Text(trimmed.to_string())
            };
            (h.trim().to_string(), value)
        })
        .collect()
}

#[async_trait::async_trait]
impl Source<ProviderRecord> for ProviderCsvFileSource {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<ProviderRecord>, SourceError>> + Send>> {
        let path = self.path.clone();
        let provider = self.provider.clone();
        let delimiter = self.delimiter;
        let s = async_stream::try_stream! {
            let received_at = file_received_at(&path);
            let file = File::open(&path)
                .map_err(|e| SourceError(format!("failed to open CSV file {}: {e}", path.display())))?;
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| SourceError(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| SourceError(format!(
                    "failed to read CSV record: {e}"
                )))?;

                yield Envelope {
                    payload: ProviderRecord {
                        provider: provider.clone(),
                        fields: record_to_fields(&record, &headers),
                    },
                    received_at,
                };
            }
        };

        Box::pin(s)
    }
}
