//! Persistence seam
//!
//! The core does not define a storage engine. Each record family is
//! persisted through a narrow trait; [`Stores`] bundles them for injection
//! into the services. [`memory`] provides a complete in-process
//! implementation used by tests and by embedders without a database.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::models::audit::{AuditLogEntry, AuditOperation};
use crate::models::conflict::ConflictRecord;
use crate::models::connection::Connection;
use crate::models::discrepancy::Discrepancy;
use crate::models::oauth_state::OAuthState;
use crate::models::record::{EntityType, Record};
use crate::models::sync_job::{JobStatus, SyncJob};

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert(&self, connection: Connection) -> Result<()>;
    async fn update(&self, connection: Connection) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Connection>>;
    /// The single non-revoked connection for (organization, vendor), if any.
    async fn find_active(&self, organization_id: Uuid, vendor: &str)
    -> Result<Option<Connection>>;
    /// Connected connections whose access token expires at or before
    /// `cutoff`. Feeds the background refresh sweep.
    async fn list_expiring(&self, cutoff: DateTime<Utc>) -> Result<Vec<Connection>>;
}

#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    async fn put(&self, state: OAuthState) -> Result<()>;
    /// Remove and return the state for `token`. At most one caller ever
    /// receives a given state (single use).
    async fn take(&self, token: &str) -> Result<Option<OAuthState>>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SyncJobStore: Send + Sync {
    async fn insert(&self, job: SyncJob) -> Result<()>;
    async fn update(&self, job: SyncJob) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<SyncJob>>;
    async fn find_with_status(&self, status: JobStatus) -> Result<Vec<SyncJob>>;
    /// Completed and in-flight jobs for an organization, newest first.
    async fn history(&self, organization_id: Uuid) -> Result<Vec<SyncJob>>;
}

/// Local entity records, keyed by (organization, entity type, record `id`).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        record: Record,
    ) -> Result<()>;
    async fn get(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<Record>>;
    /// First record whose `field` equals `value`.
    async fn find_by_field(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        field: &str,
        value: &Value,
    ) -> Result<Option<Record>>;
    /// All records, optionally restricted to those updated after the
    /// watermark.
    async fn list(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>>;
}

#[async_trait]
pub trait ConflictStore: Send + Sync {
    async fn insert(&self, conflict: ConflictRecord) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>>;
    async fn list_unresolved(&self, organization_id: Uuid) -> Result<Vec<ConflictRecord>>;
    /// Resolve a queued manual-review conflict with the chosen value.
    async fn resolve(&self, id: Uuid, value: Value) -> Result<()>;
}

#[async_trait]
pub trait DiscrepancyStore: Send + Sync {
    async fn insert(&self, discrepancy: Discrepancy) -> Result<()>;
    async fn mark_resolved(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn list(&self, organization_id: Uuid) -> Result<Vec<Discrepancy>>;
}

/// Filters for audit queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub organization_id: Option<Uuid>,
    pub operation: Option<AuditOperation>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one entry. The log is append-only; there is no update path.
    async fn append(&self, entry: AuditLogEntry) -> Result<()>;
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>>;
}

/// Store handles injected into every service.
#[derive(Clone)]
pub struct Stores {
    pub connections: Arc<dyn ConnectionStore>,
    pub oauth_states: Arc<dyn OAuthStateStore>,
    pub jobs: Arc<dyn SyncJobStore>,
    pub records: Arc<dyn RecordStore>,
    pub conflicts: Arc<dyn ConflictStore>,
    pub discrepancies: Arc<dyn DiscrepancyStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    /// Fully in-memory store set.
    pub fn in_memory() -> Self {
        let backing = Arc::new(memory::MemoryStore::new());
        Self {
            connections: backing.clone(),
            oauth_states: backing.clone(),
            jobs: backing.clone(),
            records: backing.clone(),
            conflicts: backing.clone(),
            discrepancies: backing.clone(),
            audit: backing,
        }
    }
}
