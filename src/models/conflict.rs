//! Conflict record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::record::EntityType;
use super::sync_job::ConflictStrategy;

/// One field-level disagreement found while pulling remote data over an
/// existing local record. Non-manual strategies resolve it synchronously;
/// `manual_review` leaves it unresolved for a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub entity_type: EntityType,
    /// Local record id the conflict was found on.
    pub entity_id: String,
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub strategy: ConflictStrategy,
    pub resolved: bool,
    pub resolved_value: Option<Value>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organization_id: Uuid,
        entity_type: EntityType,
        entity_id: &str,
        field: &str,
        local_value: Value,
        remote_value: Value,
        local_updated_at: Option<DateTime<Utc>>,
        remote_updated_at: Option<DateTime<Utc>>,
        strategy: ConflictStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            entity_type,
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            local_value,
            remote_value,
            local_updated_at,
            remote_updated_at,
            strategy,
            resolved: false,
            resolved_value: None,
            detected_at: Utc::now(),
        }
    }

    pub fn resolve(&mut self, value: Value) {
        self.resolved = true;
        self.resolved_value = Some(value);
    }
}
