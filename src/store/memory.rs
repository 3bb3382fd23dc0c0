//! In-memory store implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::audit::AuditLogEntry;
use crate::models::conflict::ConflictRecord;
use crate::models::connection::{Connection, ConnectionStatus};
use crate::models::discrepancy::Discrepancy;
use crate::models::oauth_state::OAuthState;
use crate::models::record::{EntityType, Record, record_timestamp};
use crate::models::sync_job::{JobStatus, SyncJob};

use super::{
    AuditQuery, AuditStore, ConflictStore, ConnectionStore, DiscrepancyStore, OAuthStateStore,
    RecordStore, Stores, SyncJobStore,
};

type RecordKey = (Uuid, EntityType, String);

/// One lock per record family; no lock is ever held across an await on
/// another family.
#[derive(Default)]
pub struct MemoryStore {
    connections: RwLock<HashMap<Uuid, Connection>>,
    oauth_states: RwLock<HashMap<String, OAuthState>>,
    jobs: RwLock<HashMap<Uuid, SyncJob>>,
    records: RwLock<HashMap<RecordKey, Record>>,
    conflicts: RwLock<HashMap<Uuid, ConflictRecord>>,
    discrepancies: RwLock<HashMap<Uuid, Discrepancy>>,
    audit: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn insert(&self, connection: Connection) -> Result<()> {
        self.connections
            .write()
            .await
            .insert(connection.id, connection);
        Ok(())
    }

    async fn update(&self, connection: Connection) -> Result<()> {
        let mut connections = self.connections.write().await;
        if !connections.contains_key(&connection.id) {
            return Err(Error::NotFound(format!("connection {}", connection.id)));
        }
        connections.insert(connection.id, connection);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Connection>> {
        Ok(self.connections.read().await.get(&id).cloned())
    }

    async fn find_active(
        &self,
        organization_id: Uuid,
        vendor: &str,
    ) -> Result<Option<Connection>> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .find(|c| {
                c.organization_id == organization_id
                    && c.vendor == vendor
                    && c.status != ConnectionStatus::Revoked
            })
            .cloned())
    }

    async fn list_expiring(&self, cutoff: DateTime<Utc>) -> Result<Vec<Connection>> {
        let mut expiring: Vec<Connection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| {
                c.status == ConnectionStatus::Connected
                    && c.refresh_token_ciphertext.is_some()
                    && c.expires_at.is_some_and(|at| at <= cutoff)
            })
            .cloned()
            .collect();
        expiring.sort_by_key(|c| c.expires_at);
        Ok(expiring)
    }
}

#[async_trait]
impl OAuthStateStore for MemoryStore {
    async fn put(&self, state: OAuthState) -> Result<()> {
        self.oauth_states
            .write()
            .await
            .insert(state.state.clone(), state);
        Ok(())
    }

    async fn take(&self, token: &str) -> Result<Option<OAuthState>> {
        Ok(self.oauth_states.write().await.remove(token))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut states = self.oauth_states.write().await;
        let before = states.len();
        states.retain(|_, state| !state.is_expired(now));
        Ok((before - states.len()) as u64)
    }
}

#[async_trait]
impl SyncJobStore for MemoryStore {
    async fn insert(&self, job: SyncJob) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn update(&self, job: SyncJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(Error::NotFound(format!("sync job {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SyncJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn find_with_status(&self, status: JobStatus) -> Result<Vec<SyncJob>> {
        let mut jobs: Vec<SyncJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn history(&self, organization_id: Uuid) -> Result<Vec<SyncJob>> {
        let mut jobs: Vec<SyncJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.organization_id == organization_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        record: Record,
    ) -> Result<()> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Internal("record is missing an 'id' field".into()))?
            .to_string();
        self.records
            .write()
            .await
            .insert((organization_id, entity_type, id), record);
        Ok(())
    }

    async fn get(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<Record>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(organization_id, entity_type, id.to_string()))
            .cloned())
    }

    async fn find_by_field(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        field: &str,
        value: &Value,
    ) -> Result<Option<Record>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|((org, et, _), record)| {
                *org == organization_id && *et == entity_type && record.get(field) == Some(value)
            })
            .map(|(_, record)| record.clone()))
    }

    async fn list(
        &self,
        organization_id: Uuid,
        entity_type: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .records
            .read()
            .await
            .iter()
            .filter(|((org, et, _), record)| {
                if *org != organization_id || *et != entity_type {
                    return false;
                }
                match updated_since {
                    Some(watermark) => record_timestamp(record, "updated_at")
                        .is_some_and(|updated| updated > watermark),
                    None => true,
                }
            })
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|r| {
            r.get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
        Ok(records)
    }
}

#[async_trait]
impl ConflictStore for MemoryStore {
    async fn insert(&self, conflict: ConflictRecord) -> Result<()> {
        self.conflicts.write().await.insert(conflict.id, conflict);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>> {
        Ok(self.conflicts.read().await.get(&id).cloned())
    }

    async fn list_unresolved(&self, organization_id: Uuid) -> Result<Vec<ConflictRecord>> {
        let mut conflicts: Vec<ConflictRecord> = self
            .conflicts
            .read()
            .await
            .values()
            .filter(|c| c.organization_id == organization_id && !c.resolved)
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.detected_at);
        Ok(conflicts)
    }

    async fn resolve(&self, id: Uuid, value: Value) -> Result<()> {
        let mut conflicts = self.conflicts.write().await;
        let conflict = conflicts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        conflict.resolve(value);
        Ok(())
    }
}

#[async_trait]
impl DiscrepancyStore for MemoryStore {
    async fn insert(&self, discrepancy: Discrepancy) -> Result<()> {
        self.discrepancies
            .write()
            .await
            .insert(discrepancy.id, discrepancy);
        Ok(())
    }

    async fn mark_resolved(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut discrepancies = self.discrepancies.write().await;
        let discrepancy = discrepancies
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("discrepancy {id}")))?;
        discrepancy.resolved_at = Some(at);
        Ok(())
    }

    async fn list(&self, organization_id: Uuid) -> Result<Vec<Discrepancy>> {
        let mut discrepancies: Vec<Discrepancy> = self
            .discrepancies
            .read()
            .await
            .values()
            .filter(|d| d.organization_id == organization_id)
            .cloned()
            .collect();
        discrepancies.sort_by_key(|d| d.discovered_at);
        Ok(discrepancies)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|entry| {
                query
                    .organization_id
                    .is_none_or(|org| entry.organization_id == org)
                    && query.operation.is_none_or(|op| entry.operation == op)
                    && query.entity_type.is_none_or(|et| entry.entity_type == Some(et))
                    && query
                        .entity_id
                        .as_ref()
                        .is_none_or(|id| entry.entity_id.as_deref() == Some(id.as_str()))
                    && query.from.is_none_or(|from| entry.created_at >= from)
                    && query.to.is_none_or(|to| entry.created_at <= to)
            })
            .cloned()
            .collect())
    }
}

impl Stores {
    /// Shared single-backing construction used by tests that need the raw
    /// [`MemoryStore`] alongside the trait handles.
    pub fn from_memory(backing: std::sync::Arc<MemoryStore>) -> Self {
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
