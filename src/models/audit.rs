//! Audit log model
//!
//! Append-only record of every mutating operation. Entries are never
//! mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::record::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    ConnectionCreate,
    TokenRefresh,
    Revoke,
    RecordCreate,
    RecordUpdate,
    ConflictResolution,
    ReconciliationFix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub operation: AuditOperation,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Field-level diff computed from the snapshots at write time.
    pub diff: Value,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Compute a `{field: {"from": .., "to": ..}}` diff of two snapshots.
/// Non-object snapshots diff as a single `value` pseudo-field.
pub fn compute_diff(before: Option<&Value>, after: Option<&Value>) -> Value {
    match (
        before.and_then(Value::as_object),
        after.and_then(Value::as_object),
    ) {
        (Some(before_map), Some(after_map)) => {
            let mut diff = Map::new();
            for (field, before_value) in before_map {
                match after_map.get(field) {
                    Some(after_value) if after_value == before_value => {}
                    Some(after_value) => {
                        diff.insert(
                            field.clone(),
                            json!({"from": before_value, "to": after_value}),
                        );
                    }
                    None => {
                        diff.insert(field.clone(), json!({"from": before_value, "to": null}));
                    }
                }
            }
            for (field, after_value) in after_map {
                if !before_map.contains_key(field) {
                    diff.insert(field.clone(), json!({"from": null, "to": after_value}));
                }
            }
            Value::Object(diff)
        }
        _ => {
            if before == after {
                json!({})
            } else {
                json!({"value": {"from": before, "to": after}})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_changed_added_and_removed_fields() {
        let before = json!({"email": "old@example.com", "name": "Ada", "phone": "555"});
        let after = json!({"email": "new@example.com", "name": "Ada", "unit": "4B"});

        let diff = compute_diff(Some(&before), Some(&after));
        let diff = diff.as_object().expect("object diff");

        assert_eq!(
            diff["email"],
            json!({"from": "old@example.com", "to": "new@example.com"})
        );
        assert_eq!(diff["phone"], json!({"from": "555", "to": null}));
        assert_eq!(diff["unit"], json!({"from": null, "to": "4B"}));
        assert!(!diff.contains_key("name"));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let snapshot = json!({"a": 1});
        assert_eq!(
            compute_diff(Some(&snapshot), Some(&snapshot)),
            json!({})
        );
        assert_eq!(compute_diff(None, None), json!({}));
    }

    #[test]
    fn diff_of_creation_has_null_from() {
        let after = json!({"id": "v-1"});
        let diff = compute_diff(None, Some(&after));
        assert_eq!(diff, json!({"value": {"from": null, "to": {"id": "v-1"}}}));
    }
}
