use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use signalhub_core::{CanonicalEntity, EntityKey, Provenance, SourceId, SourceRecord};

use crate::coerce::coerce;
use crate::error::NormalizationError;
use crate::mapping::{FieldSpec, SourceMapping};

/// Mappings keyed by source id.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mappings: BTreeMap<SourceId, SourceMapping>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source_id: SourceId, mapping: SourceMapping) {
        self.mappings.insert(source_id, mapping);
    }

    pub fn with(mut self, source_id: SourceId, mapping: SourceMapping) -> Self {
        self.register(source_id, mapping);
        self
    }

    pub fn mapping(&self, source_id: &SourceId) -> Option<&SourceMapping> {
        self.mappings.get(source_id)
    }

    /// Map one raw record onto its canonical version.
    ///
    /// `processed_at` becomes `valid_from`; nothing else reads the clock.
    pub fn normalize(
        &self,
        record: &SourceRecord,
        processed_at: DateTime<Utc>,
    ) -> Result<CanonicalEntity, NormalizationError> {
        let mapping = self
            .mappings
            .get(&record.source_id)
            .ok_or_else(|| NormalizationError::UnmappedSource(record.source_id.clone()))?;
        apply(mapping, record, processed_at)
    }
}

pub fn apply(
    mapping: &SourceMapping,
    record: &SourceRecord,
    processed_at: DateTime<Utc>,
) -> Result<CanonicalEntity, NormalizationError> {
    let object = record
        .raw_payload
        .as_object()
        .ok_or_else(|| NormalizationError::NotAnObject {
            record_ref: record.record_ref.clone(),
        })?;

    let entity_key = entity_key(mapping, object, &record.record_ref)?;

    let mut attributes = BTreeMap::new();
    for spec in &mapping.fields {
        if let Some(value) = field_value(spec, object.get(&spec.source), &record.record_ref)? {
            attributes.insert(spec.target_name().to_string(), value);
        }
    }

    let extensions = object
        .iter()
        .filter(|(name, _)| !mapping.is_mapped(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    Ok(CanonicalEntity {
        entity_type: mapping.entity_type,
        entity_key,
        attributes,
        extensions,
        valid_from: processed_at,
        valid_to: None,
        provenance: Provenance {
            source_id: record.source_id.clone(),
            batch_id: record.batch_id,
            record_ref: record.record_ref.clone(),
        },
    })
}

fn entity_key(
    mapping: &SourceMapping,
    object: &serde_json::Map<String, JsonValue>,
    record_ref: &str,
) -> Result<EntityKey, NormalizationError> {
    let mut parts = Vec::with_capacity(mapping.key_fields.len());
    for field in &mapping.key_fields {
        let part = match object.get(field) {
            Some(JsonValue::String(s)) => s.trim().to_string(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::Bool(b)) => b.to_string(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => {
                return Err(NormalizationError::InvalidValue {
                    field: field.clone(),
                    record_ref: record_ref.to_string(),
                    value: other.to_string(),
                    expected: crate::mapping::FieldType::Text,
                });
            }
        };
        if part.is_empty() {
            return Err(NormalizationError::MissingField {
                field: field.clone(),
                record_ref: record_ref.to_string(),
            });
        }
        parts.push(part);
    }

    EntityKey::new(parts.join(":")).map_err(|_| NormalizationError::MissingField {
        field: mapping.key_fields.join(","),
        record_ref: record_ref.to_string(),
    })
}

fn field_value(
    spec: &FieldSpec,
    raw: Option<&JsonValue>,
    record_ref: &str,
) -> Result<Option<signalhub_core::AttrValue>, NormalizationError> {
    let coerced = match raw {
        Some(raw) => coerce(raw, spec.field_type).map_err(|()| raw),
        None => Ok(None),
    };

    match coerced {
        Ok(Some(value)) => Ok(Some(value)),
        Ok(None) | Err(_) if spec.default.is_some() => Ok(spec
            .default
            .as_ref()
            .and_then(|d| coerce(d, spec.field_type).ok().flatten())),
        Ok(None) if spec.required => Err(NormalizationError::MissingField {
            field: spec.source.clone(),
            record_ref: record_ref.to_string(),
        }),
        Ok(None) => Ok(None),
        Err(raw) => Err(NormalizationError::InvalidValue {
            field: spec.source.clone(),
            record_ref: record_ref.to_string(),
            value: raw.to_string(),
            expected: spec.field_type,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use signalhub_core::{AttrValue, BatchId, EntityType, Watermark};

    use crate::mapping::FieldType;

    fn telco() -> SourceMapping {
        SourceMapping::new(EntityType::Customer, ["customerID"])
            .field(FieldSpec::new("tenure", FieldType::Int).required())
            .field(
                FieldSpec::new("TotalCharges", FieldType::Float)
                    .target("total_charges")
                    .with_default(json!(0)),
            )
            .field(FieldSpec::new("Churn", FieldType::Bool).target("churn"))
    }

    fn record(payload: JsonValue) -> SourceRecord {
        let source_id = SourceId::new("telco").unwrap();
        SourceRecord {
            batch_id: BatchId::for_window(&source_id, Watermark::ZERO, Watermark::new(1)),
            source_id,
            record_ref: "row:1".to_string(),
            position: Watermark::new(1),
            extracted_at: Utc::now(),
            raw_payload: payload,
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new().with(SourceId::new("telco").unwrap(), telco())
    }

    #[test]
    fn maps_fields_and_keeps_unknown_ones() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rec = record(json!({
            "customerID": "7590-VHVEG",
            "tenure": "1",
            "TotalCharges": "29.85",
            "Churn": "No",
            "gender": "Female"
        }));

        let entity = normalizer().normalize(&rec, at).unwrap();
        assert_eq!(entity.entity_key.as_str(), "7590-VHVEG");
        assert_eq!(entity.attr("tenure"), Some(&AttrValue::Int(1)));
        assert_eq!(entity.attr("total_charges"), Some(&AttrValue::Float(29.85)));
        assert_eq!(entity.attr("churn"), Some(&AttrValue::Bool(false)));
        assert_eq!(entity.extensions.get("gender"), Some(&json!("Female")));
        assert!(!entity.extensions.contains_key("customerID"));
        assert_eq!(entity.valid_from, at);
        assert!(entity.is_current());
        assert_eq!(entity.provenance.record_ref, "row:1");
    }

    #[test]
    fn blank_total_charges_falls_back_to_default() {
        let rec = record(json!({"customerID": "4472-LVYGI", "tenure": "0", "TotalCharges": " "}));
        let entity = normalizer().normalize(&rec, Utc::now()).unwrap();
        assert_eq!(entity.attr("total_charges"), Some(&AttrValue::Float(0.0)));
        assert_eq!(entity.attr("churn"), None);
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let rec = record(json!({"customerID": "a"}));
        let err = normalizer().normalize(&rec, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::MissingField {
                field: "tenure".to_string(),
                record_ref: "row:1".to_string()
            }
        );
        assert_eq!(err.field(), Some("tenure"));
    }

    #[test]
    fn uncoercible_value_without_default_is_invalid() {
        let rec = record(json!({"customerID": "a", "tenure": "ten"}));
        let err = normalizer().normalize(&rec, Utc::now()).unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidValue { expected: FieldType::Int, .. }));
    }

    #[test]
    fn missing_key_and_bad_payloads() {
        let n = normalizer();
        assert!(matches!(
            n.normalize(&record(json!({"tenure": 3})), Utc::now()),
            Err(NormalizationError::MissingField { .. })
        ));
        assert!(matches!(
            n.normalize(&record(json!([1, 2])), Utc::now()),
            Err(NormalizationError::NotAnObject { .. })
        ));

        let mut other = record(json!({}));
        other.source_id = SourceId::new("unknown").unwrap();
        assert!(matches!(
            n.normalize(&other, Utc::now()),
            Err(NormalizationError::UnmappedSource(_))
        ));
    }

    #[test]
    fn composite_keys_are_joined() {
        let mapping = SourceMapping::new(EntityType::MarketIndicator, ["ticker", "date"])
            .field(FieldSpec::new("close", FieldType::Float).required());
        let rec = record(json!({"ticker": "VZ", "date": "2024-01-02", "close": 41.2}));
        let entity = apply(&mapping, &rec, Utc::now()).unwrap();
        assert_eq!(entity.entity_key.as_str(), "VZ:2024-01-02");
    }

    #[test]
    fn normalization_is_deterministic() {
        let at = Utc::now();
        let rec = record(json!({"customerID": "a", "tenure": 5, "extra": {"nested": true}}));
        let a = normalizer().normalize(&rec, at).unwrap();
        let b = normalizer().normalize(&rec, at).unwrap();
        assert_eq!(a, b);
    }
}
