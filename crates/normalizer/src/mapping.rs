use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use signalhub_core::{DomainError, EntityType};

use crate::coerce;

/// Target type of a mapped field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    Text,
    Date,
    Timestamp,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Text => "text",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
        }
    }
}

impl core::fmt::Display for FieldType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source field mapped onto a canonical attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name in the raw payload.
    pub source: String,
    /// Canonical attribute name; defaults to `source`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Used when the value is missing or cannot be coerced.
    #[serde(default)]
    pub default: Option<JsonValue>,
}

impl FieldSpec {
    pub fn new(source: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            source: source.into(),
            target: None,
            field_type,
            required: false,
            default: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// Declarative mapping of one source onto one canonical entity type.
///
/// ```toml
/// entity_type = "customer"
/// key_fields = ["customerID"]
///
/// [[fields]]
/// source = "TotalCharges"
/// target = "total_charges"
/// type = "float"
/// default = 0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMapping {
    pub entity_type: EntityType,
    /// Fields forming the entity key; several are joined with `:`.
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl SourceMapping {
    pub fn new(entity_type: EntityType, key_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            entity_type,
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Whether `name` is consumed by the mapping (key or field source).
    pub fn is_mapped(&self, name: &str) -> bool {
        self.key_fields.iter().any(|k| k == name) || self.fields.iter().any(|f| f.source == name)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.key_fields.is_empty() {
            return Err(DomainError::validation("mapping needs at least one key field"));
        }

        let mut targets = std::collections::BTreeSet::new();
        for spec in &self.fields {
            if !targets.insert(spec.target_name()) {
                return Err(DomainError::validation(format!(
                    "duplicate target attribute '{}'",
                    spec.target_name()
                )));
            }
            if let Some(default) = &spec.default {
                if !matches!(coerce::coerce(default, spec.field_type), Ok(Some(_))) {
                    return Err(DomainError::validation(format!(
                        "default for '{}' is not a valid {}",
                        spec.source, spec.field_type
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TELCO: &str = r#"
        entity_type = "customer"
        key_fields = ["customerID"]

        [[fields]]
        source = "tenure"
        type = "int"
        required = true

        [[fields]]
        source = "TotalCharges"
        target = "total_charges"
        type = "float"
        default = 0
    "#;

    #[test]
    fn parses_toml_mapping() {
        let mapping: SourceMapping = toml::from_str(TELCO).unwrap();
        assert_eq!(mapping.entity_type, EntityType::Customer);
        assert_eq!(mapping.fields.len(), 2);
        assert_eq!(mapping.fields[1].target_name(), "total_charges");
        assert_eq!(mapping.fields[1].default, Some(json!(0)));
        assert!(mapping.validate().is_ok());
        assert!(mapping.is_mapped("customerID"));
        assert!(!mapping.is_mapped("gender"));
    }

    #[test]
    fn rejects_bad_defaults_and_duplicates() {
        let bad_default = SourceMapping::new(EntityType::Customer, ["id"])
            .field(FieldSpec::new("tenure", FieldType::Int).with_default(json!("many")));
        assert!(bad_default.validate().is_err());

        let dup = SourceMapping::new(EntityType::Customer, ["id"])
            .field(FieldSpec::new("a", FieldType::Int).target("x"))
            .field(FieldSpec::new("b", FieldType::Int).target("x"));
        assert!(dup.validate().is_err());

        let keyless = SourceMapping::new(EntityType::Customer, Vec::<String>::new());
        assert!(keyless.validate().is_err());
    }
}
