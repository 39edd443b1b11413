//! `signalhub-connectors`: source connectors.
//!
//! Connectors pull raw records from upstream sources and are registered by
//! source id. They never touch the store; everything they emit is a
//! [`signalhub_core::SourceRecord`] with a deterministic batch id.

pub mod config;
pub mod connector;
pub mod csv_file;
pub mod memory;
pub mod registry;

pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorError, PullBatch};
pub use csv_file::{CsvConnector, CsvConnectorConfig};
pub use memory::InMemoryConnector;
pub use registry::ConnectorRegistry;
