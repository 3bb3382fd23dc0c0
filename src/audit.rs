//! Audit service
//!
//! Thin write/query front over the append-only audit store. Every mutating
//! operation in the crate flows through [`AuditService::record`], which
//! snapshots before/after state and computes the field diff at write time.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::models::audit::{AuditLogEntry, AuditOperation, compute_diff};
use crate::models::record::EntityType;
use crate::store::{AuditQuery, AuditStore};

#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn AuditStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append one audit entry. The diff is derived from the snapshots here
    /// so callers cannot write an inconsistent one.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        organization_id: Uuid,
        operation: AuditOperation,
        entity_type: Option<EntityType>,
        entity_id: Option<String>,
        before: Option<Value>,
        after: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            organization_id,
            operation,
            entity_type,
            entity_id,
            diff: compute_diff(before.as_ref(), after.as_ref()),
            before,
            after,
            success: error.is_none(),
            error,
            created_at: Utc::now(),
        };
        self.store.append(entry).await
    }

    /// Best-effort variant for paths where a failed audit write must not
    /// fail the operation being audited.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_best_effort(
        &self,
        organization_id: Uuid,
        operation: AuditOperation,
        entity_type: Option<EntityType>,
        entity_id: Option<String>,
        before: Option<Value>,
        after: Option<Value>,
        error: Option<String>,
    ) {
        if let Err(err) = self
            .record(
                organization_id,
                operation,
                entity_type,
                entity_id,
                before,
                after,
                error,
            )
            .await
        {
            warn!(error = %err, ?operation, "failed to append audit entry");
        }
    }

    pub async fn query(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>> {
        self.store.query(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stores;
    use serde_json::json;

    #[tokio::test]
    async fn record_computes_diff_and_success() {
        let stores = Stores::in_memory();
        let audit = AuditService::new(stores.audit.clone());
        let org = Uuid::new_v4();

        audit
            .record(
                org,
                AuditOperation::RecordUpdate,
                Some(EntityType::Tenant),
                Some("t-1".to_string()),
                Some(json!({"email": "old@example.com"})),
                Some(json!({"email": "new@example.com"})),
                None,
            )
            .await
            .expect("append");

        let entries = audit
            .query(AuditQuery {
                organization_id: Some(org),
                ..Default::default()
            })
            .await
            .expect("query");

        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(
            entries[0].diff["email"],
            json!({"from": "old@example.com", "to": "new@example.com"})
        );
    }

    #[tokio::test]
    async fn failed_operations_carry_the_error() {
        let stores = Stores::in_memory();
        let audit = AuditService::new(stores.audit.clone());
        let org = Uuid::new_v4();

        audit
            .record(
                org,
                AuditOperation::TokenRefresh,
                None,
                None,
                None,
                None,
                Some("invalid_grant".to_string()),
            )
            .await
            .expect("append");

        let entries = audit
            .query(AuditQuery {
                organization_id: Some(org),
                operation: Some(AuditOperation::TokenRefresh),
                ..Default::default()
            })
            .await
            .expect("query");

        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].error.as_deref(), Some("invalid_grant"));
    }
}
