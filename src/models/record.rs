//! Entity types and schemaless records
//!
//! Synchronized records are schemaless JSON maps; the concrete field lists
//! per vendor are configuration, not code. The closed [`EntityType`] enum
//! fixes the categories the core understands and the dependency order syncs
//! honor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A synchronized entity record: field name to JSON value.
pub type Record = Map<String, Value>;

/// Fields maintained by the platform itself. Excluded from conflict diffs
/// and from push payload comparison.
pub const SYSTEM_FIELDS: &[&str] = &["id", "vendor_id", "created_at", "updated_at"];

/// Categories of synchronized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Property,
    Unit,
    Tenant,
    Lease,
    Payment,
    Expense,
    WorkOrder,
}

impl EntityType {
    /// Fixed dependency order: referenced entities sync before dependents,
    /// so a lease never lands on the vendor before its tenant exists.
    pub const DEPENDENCY_ORDER: &'static [EntityType] = &[
        EntityType::Property,
        EntityType::Unit,
        EntityType::Tenant,
        EntityType::Lease,
        EntityType::Payment,
        EntityType::Expense,
        EntityType::WorkOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Property => "property",
            EntityType::Unit => "unit",
            EntityType::Tenant => "tenant",
            EntityType::Lease => "lease",
            EntityType::Payment => "payment",
            EntityType::Expense => "expense",
            EntityType::WorkOrder => "work_order",
        }
    }

    /// Order `requested` by dependency position, dropping duplicates.
    pub fn in_dependency_order(requested: &[EntityType]) -> Vec<EntityType> {
        Self::DEPENDENCY_ORDER
            .iter()
            .copied()
            .filter(|et| requested.contains(et))
            .collect()
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String form of a record field, used for lookup-table keys and log output.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Field-by-field diff of two records, excluding system fields. Returns the
/// set of field names whose values differ, including fields present on only
/// one side.
pub fn changed_fields(local: &Record, remote: &Record) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for (name, local_value) in local {
        if SYSTEM_FIELDS.contains(&name.as_str()) {
            continue;
        }
        match remote.get(name) {
            Some(remote_value) if remote_value == local_value => {}
            _ => fields.push(name.clone()),
        }
    }
    for name in remote.keys() {
        if SYSTEM_FIELDS.contains(&name.as_str()) {
            continue;
        }
        if !local.contains_key(name) {
            fields.push(name.clone());
        }
    }
    fields
}

/// Parse an RFC 3339 timestamp field out of a record, if present and valid.
pub fn record_timestamp(record: &Record, field: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    record
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn dependency_order_filters_and_sorts() {
        let requested = vec![EntityType::Lease, EntityType::Property, EntityType::Tenant];
        assert_eq!(
            EntityType::in_dependency_order(&requested),
            vec![EntityType::Property, EntityType::Tenant, EntityType::Lease]
        );
    }

    #[test]
    fn changed_fields_excludes_system_fields() {
        let local = record(json!({
            "id": "l-1",
            "updated_at": "2026-01-01T00:00:00Z",
            "email": "old@example.com",
            "name": "Ada",
        }));
        let remote = record(json!({
            "id": "v-9",
            "updated_at": "2026-02-01T00:00:00Z",
            "email": "new@example.com",
            "name": "Ada",
        }));

        assert_eq!(changed_fields(&local, &remote), vec!["email".to_string()]);
    }

    #[test]
    fn changed_fields_catches_one_sided_fields() {
        let local = record(json!({"name": "Ada"}));
        let remote = record(json!({"name": "Ada", "phone": "555-0100"}));
        assert_eq!(changed_fields(&local, &remote), vec!["phone".to_string()]);
    }

    #[test]
    fn record_timestamp_parses_rfc3339() {
        let rec = record(json!({"updated_at": "2026-03-04T05:06:07Z"}));
        let ts = record_timestamp(&rec, "updated_at").expect("timestamp");
        assert_eq!(ts.to_rfc3339(), "2026-03-04T05:06:07+00:00");
        assert!(record_timestamp(&rec, "created_at").is_none());
    }

    #[test]
    fn entity_type_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&EntityType::WorkOrder).expect("serialize"),
            "\"work_order\""
        );
    }
}
