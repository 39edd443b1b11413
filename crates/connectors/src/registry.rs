use std::collections::BTreeMap;
use std::sync::Arc;

use signalhub_core::{SourceId, Watermark};

use crate::connector::{Connector, ConnectorError, PullBatch};

/// Connectors registered by source id.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<SourceId, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connector for a source.
    pub fn register(&mut self, source_id: SourceId, connector: Arc<dyn Connector>) {
        self.connectors.insert(source_id, connector);
    }

    pub fn with(mut self, source_id: SourceId, connector: Arc<dyn Connector>) -> Self {
        self.register(source_id, connector);
        self
    }

    pub fn get(&self, source_id: &SourceId) -> Option<Arc<dyn Connector>> {
        self.connectors.get(source_id).cloned()
    }

    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.connectors.contains_key(source_id)
    }

    /// Registered sources in stable order.
    pub fn sources(&self) -> Vec<SourceId> {
        self.connectors.keys().cloned().collect()
    }

    pub fn pull(&self, source_id: &SourceId, since: Watermark) -> Result<PullBatch, ConnectorError> {
        let connector = self
            .connectors
            .get(source_id)
            .ok_or_else(|| ConnectorError::Unregistered(source_id.clone()))?;
        connector.pull(source_id, since)
    }
}

impl core::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.connectors.iter().map(|(k, v)| (k.as_str(), v.describe())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;

    #[test]
    fn pull_routes_by_source() {
        let crm = SourceId::new("crm").unwrap();
        let feed = Arc::new(InMemoryConnector::new());
        feed.push(Watermark::new(1), serde_json::json!({"id": "a"}));

        let registry = ConnectorRegistry::new().with(crm.clone(), feed);
        let batch = registry.pull(&crm, Watermark::ZERO).unwrap();
        assert_eq!(batch.records.len(), 1);

        let other = SourceId::new("erp").unwrap();
        assert!(matches!(
            registry.pull(&other, Watermark::ZERO),
            Err(ConnectorError::Unregistered(_))
        ));
    }
}
