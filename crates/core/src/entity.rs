//! Raw source records and canonical entities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{BatchId, EntityKey, SourceId};
use crate::value::AttrValue;
use crate::watermark::Watermark;

/// Business entity kinds of the canonical schema.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    CustomerActivity,
    Transaction,
    SalesRecord,
    MarketIndicator,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Customer,
        EntityType::CustomerActivity,
        EntityType::Transaction,
        EntityType::SalesRecord,
        EntityType::MarketIndicator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::CustomerActivity => "customer_activity",
            EntityType::Transaction => "transaction",
            EntityType::SalesRecord => "sales_record",
            EntityType::MarketIndicator => "market_indicator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an entity version chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_key: EntityKey,
}

/// Raw payload from one connector pull. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: SourceId,
    pub batch_id: BatchId,
    /// Source-local reference (row number, upstream id) used in errors and quarantine.
    pub record_ref: String,
    /// Position of this record within the source.
    pub position: Watermark,
    pub extracted_at: DateTime<Utc>,
    pub raw_payload: JsonValue,
}

/// Where a canonical version came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: SourceId,
    pub batch_id: BatchId,
    pub record_ref: String,
}

/// Normalized business entity version.
///
/// Versions are never edited in place: a change is a new version appended to
/// the chain of its `(entity_type, entity_key)`. `valid_to` is `None` only on the
/// current version and is otherwise the `valid_from` of the successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub entity_type: EntityType,
    pub entity_key: EntityKey,
    pub attributes: BTreeMap<String, AttrValue>,
    /// Source fields without a mapping, preserved verbatim.
    #[serde(default)]
    pub extensions: BTreeMap<String, JsonValue>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub provenance: Provenance,
}

impl CanonicalEntity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type,
            entity_key: self.entity_key.clone(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    /// Whether two versions carry the same business content (ignores
    /// validity and provenance).
    pub fn same_content(&self, other: &CanonicalEntity) -> bool {
        self.entity_type == other.entity_type
            && self.entity_key == other.entity_key
            && self.attributes == other.attributes
            && self.extensions == other.extensions
    }

    /// Whether the version is valid at `at`.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|to| at < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entity(valid_to: Option<DateTime<Utc>>) -> CanonicalEntity {
        let source_id = SourceId::new("crm").unwrap();
        CanonicalEntity {
            entity_type: EntityType::Customer,
            entity_key: EntityKey::new("c-1").unwrap(),
            attributes: BTreeMap::from([("tenure".to_string(), AttrValue::Int(12))]),
            extensions: BTreeMap::new(),
            valid_from: Utc::now(),
            valid_to,
            provenance: Provenance {
                source_id,
                batch_id: BatchId::new(),
                record_ref: "row:1".to_string(),
            },
        }
    }

    #[test]
    fn same_content_ignores_provenance_and_validity() {
        let a = entity(None);
        let mut b = entity(Some(Utc::now()));
        b.provenance.record_ref = "row:99".to_string();
        assert!(a.same_content(&b));

        b.attributes.insert("tenure".to_string(), AttrValue::Int(13));
        assert!(!a.same_content(&b));
    }

    #[test]
    fn validity_interval_is_half_open() {
        let mut e = entity(None);
        let to = e.valid_from + Duration::hours(1);
        e.valid_to = Some(to);
        assert!(e.valid_at(e.valid_from));
        assert!(!e.valid_at(to));
    }

    #[test]
    fn entity_type_names_round_trip() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        let json = serde_json::to_string(&EntityType::MarketIndicator).unwrap();
        assert_eq!(json, "\"market_indicator\"");
    }
}
