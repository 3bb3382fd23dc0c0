//! Reconciliation discrepancy model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::record::EntityType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    AmountMismatch,
    DateMismatch,
    MissingOnVendor,
    MissingLocally,
    DuplicateRecord,
    StatusMismatch,
    FieldMismatch { field: String },
}

impl DiscrepancyKind {
    /// Auto-resolution eligibility is deliberately limited to the
    /// missing-record classes; value mismatches always go to a human.
    pub fn auto_resolvable(&self) -> bool {
        matches!(
            self,
            DiscrepancyKind::MissingOnVendor | DiscrepancyKind::MissingLocally
        )
    }

    pub fn default_severity(&self, entity_type: EntityType) -> Severity {
        match self {
            DiscrepancyKind::AmountMismatch => Severity::High,
            DiscrepancyKind::MissingOnVendor | DiscrepancyKind::MissingLocally => {
                if entity_type == EntityType::Payment {
                    Severity::Critical
                } else {
                    Severity::High
                }
            }
            DiscrepancyKind::DuplicateRecord => Severity::Medium,
            DiscrepancyKind::DateMismatch | DiscrepancyKind::StatusMismatch => Severity::Medium,
            DiscrepancyKind::FieldMismatch { .. } => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A reconciliation-time finding that local and vendor state disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub entity_type: EntityType,
    /// Shared key of the compared records (vendor id or natural key).
    pub record_key: String,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    pub local_record: Option<Value>,
    pub remote_record: Option<Value>,
    pub auto_resolvable: bool,
    pub discovered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Discrepancy {
    pub fn new(
        organization_id: Uuid,
        entity_type: EntityType,
        record_key: &str,
        kind: DiscrepancyKind,
        local_record: Option<Value>,
        remote_record: Option<Value>,
    ) -> Self {
        let severity = kind.default_severity(entity_type);
        let auto_resolvable = kind.auto_resolvable();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            entity_type,
            record_key: record_key.to_string(),
            kind,
            severity,
            local_record,
            remote_record,
            auto_resolvable,
            discovered_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Output of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub organization_id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub records_checked: u64,
    pub discrepancies: Vec<Discrepancy>,
    pub auto_resolved: u64,
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn unresolved_count(&self) -> u64 {
        self.discrepancies
            .iter()
            .filter(|d| d.resolved_at.is_none())
            .count() as u64
    }

    /// Percentage of checked records with no unresolved discrepancy,
    /// clamped to `[0, 100]`; 100 when nothing was checked.
    pub fn integrity_score(&self) -> f64 {
        if self.records_checked == 0 {
            return 100.0;
        }
        let unresolved = self.unresolved_count() as f64;
        let checked = self.records_checked as f64;
        (((checked - unresolved) / checked) * 100.0).clamp(0.0, 100.0)
    }
}
