use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connector::Connector;
use crate::csv_file::{CsvConnector, CsvConnectorConfig};
use crate::memory::InMemoryConnector;

/// Connector section of a `[sources.<id>]` config entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    Csv(CsvConnectorConfig),
    /// Fixed payloads at positions `1..=n`.
    Inline {
        #[serde(default)]
        records: Vec<JsonValue>,
    },
}

impl ConnectorConfig {
    pub fn build(&self) -> Arc<dyn Connector> {
        match self {
            ConnectorConfig::Csv(config) => Arc::new(CsvConnector::new(config.clone())),
            ConnectorConfig::Inline { records } => {
                Arc::new(InMemoryConnector::from_payloads(records.iter().cloned()))
            }
        }
    }
}
