//! Webhook intake
//!
//! Vendors announce changes by webhook; the embedder verifies and parses
//! the vendor-specific envelope and hands a normalized [`WebhookEvent`]
//! here. Events never mutate records directly: each one enqueues a
//! selective pull job, which the worker claims once the organization has
//! no job running. That keeps webhook-driven updates under the same
//! mutual-exclusion, mapping, and conflict rules as any other sync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionManager;
use crate::error::{Error, Result};
use crate::models::record::EntityType;
use crate::models::sync_job::{JobStatus, SyncDirection, SyncJob, SyncJobRequest, SyncMode};
use crate::orchestrator::SyncOrchestrator;
use crate::store::Stores;

/// Vendor change notification, normalized by the embedder's webhook layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub organization_id: Uuid,
    /// Vendor profile slug the event originated from.
    pub vendor: String,
    /// Vendor's event name, e.g. `tenant.updated`. Informational.
    pub event_type: String,
    pub entity_type: EntityType,
    /// Vendor-side id of the changed record.
    pub entity_id: String,
    /// Raw event payload, kept for audit trails.
    #[serde(default)]
    pub payload: Value,
}

pub struct WebhookService {
    stores: Stores,
    connections: Arc<ConnectionManager>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl WebhookService {
    pub fn new(
        stores: Stores,
        connections: Arc<ConnectionManager>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            stores,
            connections,
            orchestrator,
        }
    }

    /// Turn one event into a pending selective pull job. Returns the job,
    /// or `None` when the organization's config suppresses it or an
    /// equivalent job is already queued.
    pub async fn ingest(&self, event: WebhookEvent) -> Result<Option<SyncJob>> {
        let config = self.orchestrator.org_config(event.organization_id);
        if !config.auto_sync {
            debug!(
                organization_id = %event.organization_id,
                event_type = %event.event_type,
                "auto sync disabled; webhook ignored"
            );
            return Ok(None);
        }
        if !config.entity_enabled(event.entity_type) {
            debug!(
                organization_id = %event.organization_id,
                entity_type = %event.entity_type,
                "entity type disabled; webhook ignored"
            );
            return Ok(None);
        }

        let connection = match self
            .connections
            .find_active(event.organization_id, &event.vendor)
            .await
        {
            Ok(connection) => connection,
            Err(Error::NotFound(_)) => {
                warn!(
                    organization_id = %event.organization_id,
                    vendor = %event.vendor,
                    "webhook for a vendor with no active connection"
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        // Collapse bursts: an identical pending pull already covers this
        // record.
        let pending = self.stores.jobs.find_with_status(JobStatus::Pending).await?;
        let duplicate = pending.iter().any(|job| {
            job.organization_id == event.organization_id
                && job.direction == SyncDirection::Pull
                && job.mode == SyncMode::Selective
                && job.entity_types == vec![event.entity_type]
                && job.selective_ids.contains(&event.entity_id)
        });
        if duplicate {
            debug!(
                entity_id = %event.entity_id,
                "equivalent pull already pending; webhook collapsed"
            );
            return Ok(None);
        }

        let job = self
            .orchestrator
            .enqueue_job(SyncJobRequest {
                organization_id: event.organization_id,
                connection_id: connection.id,
                entity_types: vec![event.entity_type],
                direction: SyncDirection::Pull,
                mode: SyncMode::Selective,
                dry_run: false,
                selective_ids: vec![event.entity_id.clone()],
                updated_since: None,
            })
            .await?;

        info!(
            job_id = %job.id,
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            "webhook enqueued selective pull"
        );
        Ok(Some(job))
    }
}
