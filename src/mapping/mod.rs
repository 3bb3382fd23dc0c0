//! Mapping Engine
//!
//! Translates entity records between the local schema and a vendor schema
//! using declarative, ordered field rules. Rule kinds are a closed enum;
//! transform and calculated rules dispatch through the named
//! [`TransformRegistry`], so an unknown function name is one controlled
//! code path (warn, pass the raw value through) instead of a scattered
//! fallback.
//!
//! Failure scope is per entity: a required field that cannot be resolved
//! aborts only that entity's mapping; optional-field problems become
//! warnings on the mapped output.

pub mod transforms;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::record::{EntityType, Record, stringify_value};
pub use transforms::TransformRegistry;

/// How one field's value is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Pass the source value through unchanged.
    Direct,
    /// Translate via a value table; unmatched values pass through.
    Lookup { table: BTreeMap<String, Value> },
    /// Apply a named single-value function from the registry.
    Transform { function: String },
    /// Derive from multiple fields of the source record.
    Calculated { function: String },
    /// Choose based on another field of the source record.
    Conditional {
        field: String,
        equals: Value,
        then_value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_value: Option<Value>,
    },
    /// Embedder-supplied named function; same dispatch as `transform`.
    Custom { function: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Post-transform validation, checked before assignment into the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Type { expected: ValueKind },
    MinLength { min: usize },
    MaxLength { max: usize },
    Pattern { pattern: String },
    Range { min: Option<f64>, max: Option<f64> },
}

impl ValidationRule {
    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            ValidationRule::Type { expected } => {
                let actual = match value {
                    Value::String(_) => ValueKind::String,
                    Value::Number(_) => ValueKind::Number,
                    Value::Bool(_) => ValueKind::Boolean,
                    Value::Object(_) => ValueKind::Object,
                    Value::Array(_) => ValueKind::Array,
                    Value::Null => return Err("value is null".to_string()),
                };
                if actual == *expected {
                    Ok(())
                } else {
                    Err(format!("expected {expected:?}, got {actual:?}"))
                }
            }
            ValidationRule::MinLength { min } => match value.as_str() {
                Some(s) if s.chars().count() >= *min => Ok(()),
                Some(s) => Err(format!("length {} below minimum {min}", s.chars().count())),
                None => Err("length validation on non-string".to_string()),
            },
            ValidationRule::MaxLength { max } => match value.as_str() {
                Some(s) if s.chars().count() <= *max => Ok(()),
                Some(s) => Err(format!("length {} above maximum {max}", s.chars().count())),
                None => Err("length validation on non-string".to_string()),
            },
            ValidationRule::Pattern { pattern } => match (Regex::new(pattern), value.as_str()) {
                (Ok(re), Some(s)) if re.is_match(s) => Ok(()),
                (Ok(_), Some(s)) => Err(format!("'{s}' does not match pattern {pattern}")),
                (Ok(_), None) => Err("pattern validation on non-string".to_string()),
                // Bad pattern is a mapping-config bug, not a data problem.
                (Err(_), _) => Ok(()),
            },
            ValidationRule::Range { min, max } => match value.as_f64() {
                Some(n) => {
                    if min.is_some_and(|m| n < m) {
                        Err(format!("{n} below minimum {}", min.unwrap_or_default()))
                    } else if max.is_some_and(|m| n > m) {
                        Err(format!("{n} above maximum {}", max.unwrap_or_default()))
                    } else {
                        Ok(())
                    }
                }
                None => Err("range validation on non-number".to_string()),
            },
        }
    }
}

/// One declarative field rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationRule>,
}

impl FieldMapping {
    pub fn direct(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind: RuleKind::Direct,
            required: false,
            default: None,
            validations: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validations.push(rule);
        self
    }
}

/// Named, ordered rule lists for one entity type, one per direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMapping {
    pub entity_type: EntityType,
    pub to_vendor: Vec<FieldMapping>,
    pub from_vendor: Vec<FieldMapping>,
}

/// A mapped record plus the non-fatal problems found along the way.
#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub record: Record,
    pub warnings: Vec<String>,
}

enum Direction {
    ToVendor,
    FromVendor,
}

/// Holds the registered entity mappings and the transform registry.
/// Mappings are immutable at runtime except through [`register_mapping`].
///
/// [`register_mapping`]: MappingEngine::register_mapping
pub struct MappingEngine {
    mappings: RwLock<HashMap<EntityType, EntityMapping>>,
    transforms: TransformRegistry,
}

impl MappingEngine {
    pub fn new(transforms: TransformRegistry) -> Self {
        Self {
            mappings: RwLock::new(HashMap::new()),
            transforms,
        }
    }

    pub fn register_mapping(&self, mapping: EntityMapping) {
        self.mappings
            .write()
            .expect("mapping lock poisoned")
            .insert(mapping.entity_type, mapping);
    }

    pub fn map_to_vendor(&self, entity_type: EntityType, record: &Record) -> Result<MappedRecord> {
        self.map(entity_type, record, Direction::ToVendor)
    }

    pub fn map_from_vendor(
        &self,
        entity_type: EntityType,
        record: &Record,
    ) -> Result<MappedRecord> {
        self.map(entity_type, record, Direction::FromVendor)
    }

    fn map(
        &self,
        entity_type: EntityType,
        record: &Record,
        direction: Direction,
    ) -> Result<MappedRecord> {
        let mappings = self.mappings.read().expect("mapping lock poisoned");
        let mapping = mappings
            .get(&entity_type)
            .ok_or_else(|| Error::NotFound(format!("entity mapping for {entity_type}")))?;
        let rules = match direction {
            Direction::ToVendor => &mapping.to_vendor,
            Direction::FromVendor => &mapping.from_vendor,
        };

        let mut output = Record::new();
        let mut warnings = Vec::new();
        let mut failed_fields: Vec<String> = Vec::new();

        for rule in rules {
            let value = match self.evaluate(rule, record, &mut warnings) {
                Some(value) => value,
                None => {
                    if let Some(default) = &rule.default {
                        default.clone()
                    } else if rule.required {
                        failed_fields.push(rule.source.clone());
                        continue;
                    } else {
                        continue;
                    }
                }
            };

            if let Some(problem) = rule
                .validations
                .iter()
                .find_map(|v| v.check(&value).err())
            {
                if rule.required {
                    failed_fields.push(rule.source.clone());
                } else {
                    warnings.push(format!(
                        "field '{}' failed validation ({problem}); dropped",
                        rule.target
                    ));
                }
                continue;
            }

            output.insert(rule.target.clone(), value);
        }

        if !failed_fields.is_empty() {
            return Err(Error::Validation {
                entity_type,
                fields: failed_fields,
            });
        }

        Ok(MappedRecord {
            record: output,
            warnings,
        })
    }

    /// Resolve one rule against the source record. `None` means the source
    /// value is absent; the caller applies default/required semantics.
    fn evaluate(&self, rule: &FieldMapping, record: &Record, warnings: &mut Vec<String>) -> Option<Value> {
        match &rule.kind {
            RuleKind::Direct => record.get(&rule.source).cloned(),
            RuleKind::Lookup { table } => {
                let value = record.get(&rule.source)?;
                match table.get(&stringify_value(value)) {
                    Some(mapped) => Some(mapped.clone()),
                    // Unmatched lookup values pass through, never dropped.
                    None => Some(value.clone()),
                }
            }
            RuleKind::Transform { function } | RuleKind::Custom { function } => {
                let value = record.get(&rule.source)?;
                match self.transforms.transform(function) {
                    Some(f) => Some(f(value)),
                    None => {
                        warn!(function = %function, field = %rule.source, "unknown transform; passing raw value through");
                        warnings.push(format!(
                            "unknown transform '{function}' for field '{}'; raw value used",
                            rule.source
                        ));
                        Some(value.clone())
                    }
                }
            }
            RuleKind::Calculated { function } => match self.transforms.calculated(function) {
                Some(f) => Some(f(record)),
                None => {
                    warn!(function = %function, field = %rule.source, "unknown calculated function; passing raw value through");
                    warnings.push(format!(
                        "unknown calculated function '{function}' for field '{}'; raw value used",
                        rule.source
                    ));
                    record.get(&rule.source).cloned()
                }
            },
            RuleKind::Conditional {
                field,
                equals,
                then_value,
                else_value,
            } => {
                if record.get(field) == Some(equals) {
                    Some(then_value.clone())
                } else if let Some(else_value) = else_value {
                    Some(else_value.clone())
                } else {
                    record.get(&rule.source).cloned()
                }
            }
        }
    }
}
