//! Reconciliation & Audit Service
//!
//! Periodically verifies that local and vendor state actually agree,
//! independent of what sync jobs reported. A reconciliation run lists both
//! sides over a time window, joins records by vendor id, and files a
//! [`Discrepancy`] for every disagreement. Only missing-record findings are
//! ever fixed automatically, through the orchestrator's single-record
//! paths; value mismatches always wait for a human.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditService;
use crate::client::{RequestDescriptor, ResilientClient};
use crate::config::{PaginationStyle, VendorProfile, VendorRegistry};
use crate::connections::ConnectionManager;
use crate::error::{Error, Result};
use crate::mapping::MappingEngine;
use crate::models::audit::AuditOperation;
use crate::models::discrepancy::{Discrepancy, DiscrepancyKind, ReconciliationReport};
use crate::models::record::{EntityType, Record, changed_fields, record_timestamp, stringify_value};
use crate::orchestrator::SyncOrchestrator;
use crate::store::Stores;

/// Monetary comparisons tolerate sub-cent float noise.
const AMOUNT_TOLERANCE: f64 = 0.01;

const RECONCILE_PAGE_SIZE: usize = 100;

/// Parameters of one reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconciliationRequest {
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Fix auto-resolvable findings in place via single-record syncs.
    pub auto_fix: bool,
}

pub struct ReconciliationService {
    stores: Stores,
    vendors: Arc<VendorRegistry>,
    connections: Arc<ConnectionManager>,
    client: Arc<ResilientClient>,
    mappings: Arc<MappingEngine>,
    orchestrator: Arc<SyncOrchestrator>,
    audit: AuditService,
}

impl ReconciliationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        vendors: Arc<VendorRegistry>,
        connections: Arc<ConnectionManager>,
        client: Arc<ResilientClient>,
        mappings: Arc<MappingEngine>,
        orchestrator: Arc<SyncOrchestrator>,
        audit: AuditService,
    ) -> Self {
        Self {
            stores,
            vendors,
            connections,
            client,
            mappings,
            orchestrator,
            audit,
        }
    }

    /// Run a windowed two-sided reconciliation and return the report. Every
    /// discrepancy found is persisted before the report is returned.
    #[instrument(skip_all, fields(
        organization_id = %request.organization_id,
        connection_id = %request.connection_id,
    ))]
    pub async fn reconcile(&self, request: ReconciliationRequest) -> Result<ReconciliationReport> {
        let connection = self.connections.get(request.connection_id).await?;
        let profile = self.vendors.get(&connection.vendor)?.clone();
        let cancel = CancellationToken::new();

        let mut records_checked: u64 = 0;
        let mut discrepancies: Vec<Discrepancy> = Vec::new();
        let mut auto_resolved: u64 = 0;

        for entity_type in EntityType::in_dependency_order(&request.entity_types) {
            let local = self
                .local_window(&request, entity_type)
                .await?;
            let remote = self
                .remote_window(&request, entity_type, &profile, &cancel)
                .await?;

            let (checked, mut found) = self
                .compare_entity(&request, entity_type, &profile, local, remote, &cancel)
                .await?;
            records_checked += checked;

            for discrepancy in &found {
                self.stores.discrepancies.insert(discrepancy.clone()).await?;
                counter!(
                    "vendorsync_discrepancies_total",
                    "entity_type" => entity_type.as_str(),
                    "severity" => format!("{:?}", discrepancy.severity).to_lowercase(),
                )
                .increment(1);
            }

            if request.auto_fix {
                auto_resolved += self.auto_fix(&request, &mut found).await?;
            }

            discrepancies.append(&mut found);
        }

        let report = ReconciliationReport {
            organization_id: request.organization_id,
            entity_types: request.entity_types,
            window_start: request.window_start,
            window_end: request.window_end,
            records_checked,
            discrepancies,
            auto_resolved,
            completed_at: Utc::now(),
        };
        info!(
            organization_id = %report.organization_id,
            records_checked = report.records_checked,
            discrepancies = report.discrepancies.len(),
            auto_resolved = report.auto_resolved,
            integrity_score = report.integrity_score(),
            "reconciliation completed"
        );
        Ok(report)
    }

    async fn local_window(
        &self,
        request: &ReconciliationRequest,
        entity_type: EntityType,
    ) -> Result<Vec<Record>> {
        let records = self
            .stores
            .records
            .list(
                request.organization_id,
                entity_type,
                Some(request.window_start),
            )
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                record_timestamp(record, "updated_at")
                    .is_none_or(|ts| ts <= request.window_end)
            })
            .collect())
    }

    async fn remote_window(
        &self,
        request: &ReconciliationRequest,
        entity_type: EntityType,
        profile: &VendorProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page: u64 = 1;

        loop {
            let mut descriptor = RequestDescriptor::list(entity_type).with_filter(
                &profile.updated_since_param,
                &request.window_start.to_rfc3339(),
            );
            match &profile.pagination {
                PaginationStyle::Cursor { param, .. } => {
                    if let Some(cursor) = &cursor {
                        descriptor = descriptor.with_filter(param, cursor);
                    }
                }
                PaginationStyle::PageNumber {
                    page_param,
                    size_param,
                } => {
                    descriptor = descriptor
                        .with_filter(page_param, &page.to_string())
                        .with_filter(size_param, &RECONCILE_PAGE_SIZE.to_string());
                }
            }

            let envelope = self
                .client
                .execute(request.connection_id, &descriptor, cancel)
                .await?;
            if !envelope.success {
                return Err(Error::Internal(format!(
                    "{entity_type} reconciliation listing failed: {}",
                    envelope.errors.join("; ")
                )));
            }

            let raw = envelope.list_records(&profile.list_key);
            let fetched = raw.len();
            for value in raw {
                if let Some(record) = value.as_object() {
                    records.push(record.clone());
                }
            }

            match &profile.pagination {
                PaginationStyle::Cursor { .. } => {
                    let pagination = envelope.pagination.unwrap_or_default();
                    if !pagination.has_more || pagination.next_cursor.is_none() {
                        break;
                    }
                    cursor = pagination.next_cursor;
                }
                PaginationStyle::PageNumber { .. } => {
                    if fetched < RECONCILE_PAGE_SIZE {
                        break;
                    }
                    page += 1;
                }
            }
        }
        Ok(records)
    }

    async fn compare_entity(
        &self,
        request: &ReconciliationRequest,
        entity_type: EntityType,
        profile: &VendorProfile,
        local: Vec<Record>,
        remote: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<(u64, Vec<Discrepancy>)> {
        let mut discrepancies = Vec::new();

        // Index the remote side by vendor record id, flagging duplicates.
        let mut remote_by_id: HashMap<String, Record> = HashMap::new();
        for record in remote {
            let Some(id) = record.get("id").map(stringify_value) else {
                continue;
            };
            if let Some(first) = remote_by_id.get(&id) {
                discrepancies.push(Discrepancy::new(
                    request.organization_id,
                    entity_type,
                    &id,
                    DiscrepancyKind::DuplicateRecord,
                    None,
                    Some(Value::Object(first.clone())),
                ));
                continue;
            }
            remote_by_id.insert(id, record);
        }

        let mut seen_vendor_ids: HashMap<String, String> = HashMap::new();
        let mut matched_remote: Vec<String> = Vec::new();
        let mut checked: u64 = local.len() as u64;

        for local_record in &local {
            let local_id = local_record.get("id").map(stringify_value).unwrap_or_default();
            let Some(vendor_id) = local_record.get("vendor_id").map(stringify_value) else {
                // Never pushed: missing on the vendor by definition.
                discrepancies.push(Discrepancy::new(
                    request.organization_id,
                    entity_type,
                    &local_id,
                    DiscrepancyKind::MissingOnVendor,
                    Some(Value::Object(local_record.clone())),
                    None,
                ));
                continue;
            };

            if let Some(other_local) = seen_vendor_ids.insert(vendor_id.clone(), local_id.clone()) {
                discrepancies.push(Discrepancy::new(
                    request.organization_id,
                    entity_type,
                    &vendor_id,
                    DiscrepancyKind::DuplicateRecord,
                    Some(Value::Object(local_record.clone())),
                    None,
                ));
                debug!(%vendor_id, other_local, "two local records share one vendor id");
                continue;
            }

            let remote_record = match remote_by_id.get(&vendor_id) {
                Some(record) => Some(record.clone()),
                // Not in the windowed listing; confirm with a point read
                // before declaring it missing.
                None => self
                    .fetch_remote(request.connection_id, entity_type, &vendor_id, cancel)
                    .await?,
            };

            let Some(remote_record) = remote_record else {
                discrepancies.push(Discrepancy::new(
                    request.organization_id,
                    entity_type,
                    &vendor_id,
                    DiscrepancyKind::MissingOnVendor,
                    Some(Value::Object(local_record.clone())),
                    None,
                ));
                continue;
            };
            matched_remote.push(vendor_id.clone());

            let mapped = match self.mappings.map_from_vendor(entity_type, &remote_record) {
                Ok(mapped) => mapped.record,
                Err(Error::NotFound(_)) => remote_record.clone(),
                Err(err) => return Err(err),
            };

            for field in changed_fields(local_record, &mapped) {
                if let Some(kind) = classify_field(
                    &field,
                    local_record.get(&field),
                    mapped.get(&field),
                ) {
                    discrepancies.push(Discrepancy::new(
                        request.organization_id,
                        entity_type,
                        &vendor_id,
                        kind,
                        Some(Value::Object(local_record.clone())),
                        Some(Value::Object(remote_record.clone())),
                    ));
                }
            }
        }

        // Remote records with no local counterpart.
        for (vendor_id, remote_record) in &remote_by_id {
            if matched_remote.contains(vendor_id) || seen_vendor_ids.contains_key(vendor_id) {
                continue;
            }
            checked += 1;
            discrepancies.push(Discrepancy::new(
                request.organization_id,
                entity_type,
                vendor_id,
                DiscrepancyKind::MissingLocally,
                None,
                Some(Value::Object(remote_record.clone())),
            ));
        }

        Ok((checked, discrepancies))
    }

    async fn fetch_remote(
        &self,
        connection_id: Uuid,
        entity_type: EntityType,
        vendor_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Record>> {
        let descriptor = RequestDescriptor::get(entity_type, vendor_id);
        let envelope = self.client.execute(connection_id, &descriptor, cancel).await?;
        if !envelope.success {
            return Ok(None);
        }
        Ok(envelope.payload.as_object().cloned())
    }

    /// Fix missing-record findings through the orchestrator's single-record
    /// paths. Failures leave the discrepancy unresolved and move on.
    async fn auto_fix(
        &self,
        request: &ReconciliationRequest,
        discrepancies: &mut [Discrepancy],
    ) -> Result<u64> {
        let mut fixed: u64 = 0;
        for discrepancy in discrepancies.iter_mut() {
            if !discrepancy.auto_resolvable {
                continue;
            }

            let fix = match &discrepancy.kind {
                DiscrepancyKind::MissingOnVendor => {
                    let local_id = discrepancy
                        .local_record
                        .as_ref()
                        .and_then(|r| r.get("id"))
                        .map(stringify_value)
                        .unwrap_or_else(|| discrepancy.record_key.clone());
                    self.orchestrator
                        .push_single(
                            request.organization_id,
                            request.connection_id,
                            discrepancy.entity_type,
                            &local_id,
                        )
                        .await
                }
                DiscrepancyKind::MissingLocally => {
                    self.orchestrator
                        .pull_single(
                            request.organization_id,
                            request.connection_id,
                            discrepancy.entity_type,
                            &discrepancy.record_key,
                        )
                        .await
                }
                _ => continue,
            };

            match fix {
                Ok(()) => {
                    let now = Utc::now();
                    discrepancy.resolved_at = Some(now);
                    self.stores
                        .discrepancies
                        .mark_resolved(discrepancy.id, now)
                        .await?;
                    fixed += 1;
                    self.audit
                        .record_best_effort(
                            request.organization_id,
                            AuditOperation::ReconciliationFix,
                            Some(discrepancy.entity_type),
                            Some(discrepancy.record_key.clone()),
                            None,
                            Some(serde_json::json!({
                                "kind": discrepancy.kind,
                                "severity": discrepancy.severity,
                            })),
                            None,
                        )
                        .await;
                }
                Err(err) if err.halts_job() => return Err(err),
                Err(err) => {
                    warn!(
                        record_key = %discrepancy.record_key,
                        error = %err,
                        "auto-fix failed; leaving discrepancy open"
                    );
                }
            }
        }
        Ok(fixed)
    }

    /// Stored discrepancies for an organization, open and resolved.
    pub async fn list_discrepancies(&self, organization_id: Uuid) -> Result<Vec<Discrepancy>> {
        self.stores.discrepancies.list(organization_id).await
    }

    /// Close a discrepancy after an out-of-band correction.
    pub async fn resolve_discrepancy(&self, id: Uuid) -> Result<()> {
        self.stores.discrepancies.mark_resolved(id, Utc::now()).await
    }
}

/// Classify one field-level disagreement, or `None` when the values agree
/// within tolerance.
fn classify_field(
    field: &str,
    local: Option<&Value>,
    remote: Option<&Value>,
) -> Option<DiscrepancyKind> {
    if is_amount_field(field) {
        if let (Some(local), Some(remote)) = (
            local.and_then(Value::as_f64),
            remote.and_then(Value::as_f64),
        ) {
            if (local - remote).abs() <= AMOUNT_TOLERANCE {
                return None;
            }
            return Some(DiscrepancyKind::AmountMismatch);
        }
        return Some(DiscrepancyKind::AmountMismatch);
    }
    if field == "status" {
        return Some(DiscrepancyKind::StatusMismatch);
    }
    if is_date_field(field) {
        return Some(DiscrepancyKind::DateMismatch);
    }
    Some(DiscrepancyKind::FieldMismatch {
        field: field.to_string(),
    })
}

fn is_amount_field(field: &str) -> bool {
    field.contains("amount")
        || field.contains("balance")
        || field.contains("total")
        || field.contains("rent")
        || field.contains("price")
}

fn is_date_field(field: &str) -> bool {
    field.ends_with("_date") || field.ends_with("_at") || field == "date"
}
