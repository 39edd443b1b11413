use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use signalhub_core::{BatchId, SourceId, SourceRecord, Watermark};

use crate::connector::{Connector, ConnectorError, PullBatch};

fn default_page_size() -> usize {
    5000
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvConnectorConfig {
    pub path: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Header columns that must be present; a missing one is schema drift.
    #[serde(default)]
    pub required_columns: Vec<String>,
    /// Column used as `record_ref`; falls back to `row:N`.
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl CsvConnectorConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: default_page_size(),
            required_columns: Vec::new(),
            id_column: None,
            delimiter: default_delimiter(),
        }
    }
}

/// Reads a CSV export. The watermark is the 1-based data row offset.
///
/// Every cell becomes a trimmed JSON string; typing happens in the normalizer.
#[derive(Debug, Clone)]
pub struct CsvConnector {
    config: CsvConnectorConfig,
}

impl CsvConnector {
    pub fn new(config: CsvConnectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CsvConnectorConfig {
        &self.config
    }

    fn reader(&self) -> Result<csv::Reader<std::fs::File>, ConnectorError> {
        let delimiter = u8::try_from(self.config.delimiter).map_err(|_| {
            ConnectorError::SourceSchemaDrift(format!(
                "delimiter '{}' is not a single byte",
                self.config.delimiter
            ))
        })?;

        csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.config.path)
            .map_err(|e| {
                ConnectorError::SourceUnavailable(format!("{}: {e}", self.config.path.display()))
            })
    }
}

impl Connector for CsvConnector {
    fn pull(&self, source_id: &SourceId, since: Watermark) -> Result<PullBatch, ConnectorError> {
        let mut reader = self.reader()?;

        let headers = reader
            .headers()
            .map_err(|e| ConnectorError::SourceSchemaDrift(format!("unreadable header: {e}")))?
            .clone();

        let missing: Vec<&str> = self
            .config
            .required_columns
            .iter()
            .filter(|c| !headers.iter().any(|h| h == c.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ConnectorError::SourceSchemaDrift(format!(
                "missing columns: {}",
                missing.join(", ")
            )));
        }

        let skip = since.as_offset();
        let page_size = self.config.page_size.max(1);
        let mut rows = Vec::new();

        for (idx, row) in reader.records().enumerate() {
            let offset = idx as u64 + 1;
            if offset <= skip {
                continue;
            }
            if rows.len() >= page_size {
                break;
            }
            let row = row.map_err(|e| match e.kind() {
                csv::ErrorKind::Io(_) => ConnectorError::SourceUnavailable(e.to_string()),
                _ => ConnectorError::SourceSchemaDrift(format!("row {offset}: {e}")),
            })?;

            let mut object = Map::new();
            for (name, cell) in headers.iter().zip(row.iter()) {
                object.insert(name.to_string(), JsonValue::String(cell.to_string()));
            }

            let record_ref = self
                .config
                .id_column
                .as_deref()
                .and_then(|col| object.get(col))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("row:{offset}"));

            rows.push((Watermark::from_offset(offset), record_ref, JsonValue::Object(object)));
        }

        let Some((new_watermark, _, _)) = rows.last().cloned() else {
            return Ok(PullBatch::empty(since));
        };

        let batch_id = BatchId::for_window(source_id, since, new_watermark);
        let extracted_at = Utc::now();
        let records = rows
            .into_iter()
            .map(|(position, record_ref, raw_payload)| SourceRecord {
                source_id: source_id.clone(),
                batch_id,
                record_ref,
                position,
                extracted_at,
                raw_payload,
            })
            .collect();

        tracing::debug!(
            source_id = %source_id,
            since = %since,
            new_watermark = %new_watermark,
            "csv page read"
        );

        Ok(PullBatch {
            records,
            new_watermark,
        })
    }

    fn describe(&self) -> String {
        format!("csv file {}", self.config.path.display())
    }
}
