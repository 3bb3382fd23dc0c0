//! Sync Orchestrator
//!
//! Runs synchronization jobs: push (local to vendor), pull (vendor to
//! local), and bidirectional. At most one job runs per organization at a
//! time; a process-wide worker pool caps concurrency across organizations.
//! Entity types sync in dependency order, work proceeds in batches, and
//! cancellation, pause, and progress persistence all happen at batch
//! boundaries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditService;
use crate::client::{RequestDescriptor, ResilientClient};
use crate::config::{
    OrgConfigs, OrgSyncConfig, PaginationStyle, SyncSettings, VendorProfile, VendorRegistry,
};
use crate::connections::ConnectionManager;
use crate::error::{Error, Result};
use crate::mapping::MappingEngine;
use crate::models::audit::AuditOperation;
use crate::models::conflict::ConflictRecord;
use crate::models::record::{
    EntityType, Record, changed_fields, record_timestamp, stringify_value,
};
use crate::models::sync_job::{
    ConflictStrategy, JobStatus, SyncDirection, SyncJob, SyncJobRequest, SyncMode,
};

/// Releases the organization's running slot when the job ends, however it
/// ends.
struct OrgSlot {
    organization_id: Uuid,
    slots: Arc<std::sync::Mutex<HashSet<Uuid>>>,
}

impl Drop for OrgSlot {
    fn drop(&mut self) {
        self.slots
            .lock()
            .expect("org slot lock poisoned")
            .remove(&self.organization_id);
    }
}

struct RunningJob {
    cancel: CancellationToken,
    pause: CancellationToken,
}

enum BatchFlow {
    Continue,
    Paused,
}

/// Result of syncing one record, either direction.
enum RecordOutcome {
    Succeeded,
    Created(Option<String>),
    Skipped,
    Failed(String),
}

struct RecordResult {
    outcome: RecordOutcome,
    warnings: Vec<String>,
}

impl RecordResult {
    fn new(outcome: RecordOutcome) -> Self {
        Self {
            outcome,
            warnings: Vec::new(),
        }
    }
}

/// Shared per-job context cloned into fan-out tasks.
#[derive(Clone)]
struct JobScope {
    organization_id: Uuid,
    connection_id: Uuid,
    profile: VendorProfile,
    strategy: ConflictStrategy,
    dry_run: bool,
    cancel: CancellationToken,
}

pub struct SyncOrchestrator {
    settings: SyncSettings,
    vendors: Arc<VendorRegistry>,
    stores: crate::store::Stores,
    connections: Arc<ConnectionManager>,
    client: Arc<ResilientClient>,
    mappings: Arc<MappingEngine>,
    audit: AuditService,
    org_configs: OrgConfigs,
    running_orgs: Arc<std::sync::Mutex<HashSet<Uuid>>>,
    running_jobs: std::sync::Mutex<HashMap<Uuid, RunningJob>>,
    handles: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    workers: Arc<Semaphore>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SyncSettings,
        vendors: Arc<VendorRegistry>,
        stores: crate::store::Stores,
        connections: Arc<ConnectionManager>,
        client: Arc<ResilientClient>,
        mappings: Arc<MappingEngine>,
        audit: AuditService,
        org_configs: OrgConfigs,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.worker_pool_size));
        Self {
            settings,
            vendors,
            stores,
            connections,
            client,
            mappings,
            audit,
            org_configs,
            running_orgs: Arc::new(std::sync::Mutex::new(HashSet::new())),
            running_jobs: std::sync::Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            workers,
        }
    }

    pub fn set_org_config(&self, config: OrgSyncConfig) {
        self.org_configs.set(config);
    }

    pub fn org_config(&self, organization_id: Uuid) -> OrgSyncConfig {
        self.org_configs.get(organization_id)
    }

    /// Persist a new job in `pending` state. A worker (or an explicit
    /// [`start_job`]) picks it up later.
    ///
    /// [`start_job`]: SyncOrchestrator::start_job
    pub async fn enqueue_job(&self, request: SyncJobRequest) -> Result<SyncJob> {
        let config = self.org_config(request.organization_id);
        let job = SyncJob::from_request(request, config.batch_size, config.conflict_strategy);
        self.stores.jobs.insert(job.clone()).await?;
        debug!(job_id = %job.id, organization_id = %job.organization_id, "job enqueued");
        Ok(job)
    }

    /// Start a pending or paused job. Fails with `SyncInProgress` when the
    /// organization already has a running job.
    pub async fn start_job(self: &Arc<Self>, job_id: Uuid) -> Result<()> {
        let mut job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync job {job_id}")))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Paused) {
            return Err(Error::Internal(format!(
                "job {job_id} is {:?}, not startable",
                job.status
            )));
        }

        let slot = {
            let mut slots = self.running_orgs.lock().expect("org slot lock poisoned");
            if !slots.insert(job.organization_id) {
                return Err(Error::SyncInProgress(job.organization_id));
            }
            OrgSlot {
                organization_id: job.organization_id,
                slots: self.running_orgs.clone(),
            }
        };

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("worker pool closed: {e}")))?;

        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        self.running_jobs
            .lock()
            .expect("running jobs lock poisoned")
            .insert(
                job.id,
                RunningJob {
                    cancel: cancel.clone(),
                    pause: pause.clone(),
                },
            );

        job.status = JobStatus::Running;
        job.started_at.get_or_insert(Utc::now());
        self.stores.jobs.update(job.clone()).await?;

        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _permit = permit;
            orchestrator.execute_job(job, cancel, pause).await;
        });
        let mut handles = self.handles.lock().await;
        // Worker-claimed jobs are never joined; drop their settled handles
        // here so the map stays bounded.
        handles.retain(|_, handle| !handle.is_finished());
        handles.insert(job_id, handle);
        Ok(())
    }

    /// Enqueue, start, and wait for a job. The synchronous entry point for
    /// embedders that want a blocking run.
    pub async fn run_to_completion(self: &Arc<Self>, request: SyncJobRequest) -> Result<SyncJob> {
        let job = self.enqueue_job(request).await?;
        self.start_job(job.id).await?;
        self.join(job.id).await
    }

    /// Request cancellation. A running job stops at its next batch
    /// boundary; a pending job is cancelled immediately.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let running = self
            .running_jobs
            .lock()
            .expect("running jobs lock poisoned")
            .get(&job_id)
            .map(|r| r.cancel.clone());
        if let Some(cancel) = running {
            cancel.cancel();
            return Ok(());
        }

        let mut job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync job {job_id}")))?;
        if !job.status.can_transition(JobStatus::Cancelled) {
            return Err(Error::Internal(format!(
                "job {job_id} is {:?}, not cancellable",
                job.status
            )));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.stores.jobs.update(job).await
    }

    /// Request a pause at the next batch boundary.
    pub fn pause_job(&self, job_id: Uuid) -> Result<()> {
        let running = self.running_jobs.lock().expect("running jobs lock poisoned");
        match running.get(&job_id) {
            Some(job) => {
                job.pause.cancel();
                Ok(())
            }
            None => Err(Error::NotFound(format!("running job {job_id}"))),
        }
    }

    /// Resume a paused job. Re-runs from the job's parameters; record
    /// operations are idempotent upserts, so replayed work converges.
    pub async fn resume_job(self: &Arc<Self>, job_id: Uuid) -> Result<()> {
        self.start_job(job_id).await
    }

    /// Wait for a started job to settle and return its final state.
    pub async fn join(&self, job_id: Uuid) -> Result<SyncJob> {
        let handle = self.handles.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Internal(format!("job task panicked: {e}")))?;
        }
        self.stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync job {job_id}")))
    }

    /// Past and in-flight jobs for an organization, newest first.
    pub async fn job_history(&self, organization_id: Uuid) -> Result<Vec<SyncJob>> {
        self.stores.jobs.history(organization_id).await
    }

    /// Claim loop for pending jobs. Organizations with a running job are
    /// skipped and retried on the next tick. Runs until `shutdown` fires.
    pub async fn run_worker(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = std::time::Duration::from_millis(self.settings.worker_tick_ms);
        info!(tick_ms = self.settings.worker_tick_ms, "sync worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync worker stopping");
                    return;
                }
                _ = tokio::time::sleep(tick) => {}
            }

            let pending = match self.stores.jobs.find_with_status(JobStatus::Pending).await {
                Ok(pending) => pending,
                Err(err) => {
                    error!(error = %err, "failed to list pending jobs");
                    continue;
                }
            };

            for job in pending {
                match self.start_job(job.id).await {
                    Ok(()) => {}
                    Err(Error::SyncInProgress(_)) => {}
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "failed to start pending job");
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(
        job_id = %job.id,
        organization_id = %job.organization_id,
        direction = ?job.direction,
    ))]
    async fn execute_job(
        self: Arc<Self>,
        mut job: SyncJob,
        cancel: CancellationToken,
        pause: CancellationToken,
    ) {
        let job_id = job.id;
        // Guarantees the running-jobs entry clears even if a sync path
        // panics; the org slot guard handles the slot the same way.
        let registry = self.clone();
        scopeguard::defer! {
            registry
                .running_jobs
                .lock()
                .expect("running jobs lock poisoned")
                .remove(&job_id);
        }
        let timeout = self
            .org_config(job.organization_id)
            .job_timeout_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| self.settings.job_timeout());

        let run = tokio::time::timeout(timeout, self.run_job(&mut job, &cancel, &pause)).await;
        let result = match run {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        let outcome_label = match result {
            Ok(BatchFlow::Paused) => {
                job.status = JobStatus::Paused;
                "paused"
            }
            Ok(BatchFlow::Continue) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                if let Err(err) = self.connections.mark_synced(job.connection_id).await {
                    warn!(job_id = %job_id, error = %err, "failed to stamp last_sync_at");
                }
                "completed"
            }
            Err(Error::Cancelled) => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                "cancelled"
            }
            Err(err) => {
                job.errors.push(err.to_string());
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                error!(job_id = %job_id, error = %err, "sync job failed");
                "failed"
            }
        };

        let totals = job.outcome();
        if let Err(err) = self.stores.jobs.update(job).await {
            error!(job_id = %job_id, error = %err, "failed to persist final job state");
        }

        counter!("vendorsync_sync_jobs_total", "outcome" => outcome_label).increment(1);
        info!(
            job_id = %job_id,
            outcome = outcome_label,
            succeeded = totals.success_count,
            failed = totals.failure_count,
            skipped = totals.skipped_count,
            created = totals.created_records.len(),
            "sync job settled"
        );
    }

    async fn run_job(
        self: &Arc<Self>,
        job: &mut SyncJob,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<BatchFlow> {
        let connection = self.connections.get(job.connection_id).await?;
        if connection.organization_id != job.organization_id {
            return Err(Error::Internal(
                "job references a connection of another organization".to_string(),
            ));
        }
        let profile = self.vendors.get(&connection.vendor)?.clone();
        let config = self.org_config(job.organization_id);

        let scope = JobScope {
            organization_id: job.organization_id,
            connection_id: job.connection_id,
            profile,
            strategy: job.conflict_strategy,
            dry_run: job.dry_run,
            cancel: cancel.clone(),
        };

        for entity_type in EntityType::in_dependency_order(&job.entity_types) {
            if !config.entity_enabled(entity_type) {
                job.warnings
                    .push(format!("{entity_type} disabled for organization; skipped"));
                continue;
            }

            let flow = match job.direction {
                SyncDirection::Push => {
                    self.push_entity(job, entity_type, &scope, pause).await?
                }
                SyncDirection::Pull => {
                    self.pull_entity(job, entity_type, &scope, pause).await?
                }
                SyncDirection::Bidirectional => {
                    match self.push_entity(job, entity_type, &scope, pause).await? {
                        BatchFlow::Paused => BatchFlow::Paused,
                        BatchFlow::Continue => {
                            self.pull_entity(job, entity_type, &scope, pause).await?
                        }
                    }
                }
            };
            if matches!(flow, BatchFlow::Paused) {
                return Ok(BatchFlow::Paused);
            }
        }
        Ok(BatchFlow::Continue)
    }

    async fn push_entity(
        self: &Arc<Self>,
        job: &mut SyncJob,
        entity_type: EntityType,
        scope: &JobScope,
        pause: &CancellationToken,
    ) -> Result<BatchFlow> {
        let records = match job.mode {
            SyncMode::Selective => {
                let mut records = Vec::with_capacity(job.selective_ids.len());
                for id in &job.selective_ids {
                    if let Some(record) = self
                        .stores
                        .records
                        .get(job.organization_id, entity_type, id)
                        .await?
                    {
                        records.push(record);
                    } else {
                        job.warnings
                            .push(format!("{entity_type} {id} not found locally; skipped"));
                    }
                }
                records
            }
            SyncMode::Incremental => {
                self.stores
                    .records
                    .list(job.organization_id, entity_type, job.updated_since)
                    .await?
            }
            SyncMode::Full => {
                self.stores
                    .records
                    .list(job.organization_id, entity_type, None)
                    .await?
            }
        };

        job.progress.entry(entity_type).or_default().total = records.len() as u64;

        let fan_out = Arc::new(Semaphore::new(self.settings.batch_concurrency));
        for batch in records.chunks(job.batch_size.max(1)) {
            if scope.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if pause.is_cancelled() {
                self.stores.jobs.update(job.clone()).await?;
                return Ok(BatchFlow::Paused);
            }

            let mut handles = Vec::with_capacity(batch.len());
            for record in batch {
                let permit = fan_out
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("semaphore closed: {e}")))?;
                let orchestrator = self.clone();
                let scope = scope.clone();
                let record = record.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    orchestrator.push_record(&scope, entity_type, record).await
                }));
            }

            for handle in handles {
                let result = handle
                    .await
                    .map_err(|e| Error::Internal(format!("push task panicked: {e}")))??;
                apply_result(job, entity_type, result);
            }

            // Batch boundary: persist progress.
            self.stores.jobs.update(job.clone()).await?;
        }

        counter!(
            "vendorsync_records_synced_total",
            "entity_type" => entity_type.as_str(),
            "direction" => "push",
        )
        .increment(job.progress.get(&entity_type).map(|p| p.succeeded).unwrap_or(0));
        Ok(BatchFlow::Continue)
    }

    /// Push one local record: update when a vendor link exists, otherwise
    /// match by natural key, otherwise create. A 404 on update is a create
    /// signal (the linked record no longer exists on the vendor).
    async fn push_record(
        self: &Arc<Self>,
        scope: &JobScope,
        entity_type: EntityType,
        record: Record,
    ) -> Result<RecordResult> {
        let mapped = match self.mappings.map_to_vendor(entity_type, &record) {
            Ok(mapped) => mapped,
            Err(err @ Error::Validation { .. }) => {
                return Ok(RecordResult::new(RecordOutcome::Failed(err.to_string())));
            }
            Err(err) => return Err(err),
        };
        let mut result = RecordResult::new(RecordOutcome::Skipped);
        result.warnings = mapped.warnings;

        let payload = Value::Object(mapped.record);
        let local_id = record.get("id").map(stringify_value);

        // Existing vendor link: update in place.
        if let Some(vendor_id) = record.get("vendor_id").map(stringify_value) {
            if scope.dry_run {
                // Dry runs still look the counterpart up so the report can
                // say whether the write would update or create.
                let descriptor = RequestDescriptor::get(entity_type, &vendor_id);
                let envelope = self
                    .client
                    .execute(scope.connection_id, &descriptor, &scope.cancel)
                    .await?;
                result.warnings.push(if envelope.success {
                    format!("{entity_type}: would update vendor record {vendor_id}")
                } else {
                    format!("{entity_type}: vendor link {vendor_id} is stale, would create")
                });
                result.outcome = RecordOutcome::Succeeded;
                return Ok(result);
            }
            let descriptor = RequestDescriptor::update(entity_type, &vendor_id, payload.clone());
            let envelope = self
                .client
                .execute(scope.connection_id, &descriptor, &scope.cancel)
                .await?;
            if envelope.success {
                self.audit
                    .record_best_effort(
                        scope.organization_id,
                        AuditOperation::RecordUpdate,
                        Some(entity_type),
                        local_id,
                        Some(Value::Object(record)),
                        Some(payload),
                        None,
                    )
                    .await;
                result.outcome = RecordOutcome::Succeeded;
                return Ok(result);
            }
            if envelope.status != 404 {
                result.outcome = RecordOutcome::Failed(envelope.errors.join("; "));
                return Ok(result);
            }
            // Fall through: the linked record is gone on the vendor side.
            debug!(%vendor_id, %entity_type, "linked vendor record missing; creating");
        } else if let Some(natural_key) = scope.profile.natural_key(entity_type)
            && let Some(key_value) = record.get(natural_key)
        {
            // No link yet: try to adopt an existing vendor record by its
            // natural key before creating a duplicate.
            let descriptor = RequestDescriptor::list(entity_type)
                .with_filter(natural_key, &stringify_value(key_value));
            let envelope = self
                .client
                .execute(scope.connection_id, &descriptor, &scope.cancel)
                .await?;
            let adopted = if envelope.success {
                envelope
                    .list_records(&scope.profile.list_key)
                    .first()
                    .and_then(|found| found.get("id"))
                    .map(stringify_value)
            } else {
                None
            };
            if scope.dry_run {
                result.warnings.push(match &adopted {
                    Some(vendor_id) => {
                        format!("{entity_type}: would adopt and update vendor record {vendor_id}")
                    }
                    None => format!("{entity_type}: would create"),
                });
                result.outcome = RecordOutcome::Succeeded;
                return Ok(result);
            }
            if let Some(vendor_id) = adopted {
                let descriptor =
                    RequestDescriptor::update(entity_type, &vendor_id, payload.clone());
                let envelope = self
                    .client
                    .execute(scope.connection_id, &descriptor, &scope.cancel)
                    .await?;
                if envelope.success {
                    self.link_vendor_id(scope, entity_type, record.clone(), &vendor_id)
                        .await?;
                    self.audit
                        .record_best_effort(
                            scope.organization_id,
                            AuditOperation::RecordUpdate,
                            Some(entity_type),
                            local_id,
                            Some(Value::Object(record)),
                            Some(payload),
                            None,
                        )
                        .await;
                    result.outcome = RecordOutcome::Succeeded;
                    return Ok(result);
                }
                result.outcome = RecordOutcome::Failed(envelope.errors.join("; "));
                return Ok(result);
            }
        }

        if scope.dry_run {
            result
                .warnings
                .push(format!("{entity_type}: would create"));
            result.outcome = RecordOutcome::Succeeded;
            return Ok(result);
        }

        let descriptor = RequestDescriptor::create(entity_type, payload.clone());
        let envelope = self
            .client
            .execute(scope.connection_id, &descriptor, &scope.cancel)
            .await?;
        if !envelope.success {
            result.outcome = RecordOutcome::Failed(envelope.errors.join("; "));
            return Ok(result);
        }

        let vendor_id = envelope.payload.get("id").map(stringify_value);
        if let Some(vendor_id) = &vendor_id {
            self.link_vendor_id(scope, entity_type, record.clone(), vendor_id)
                .await?;
        }
        self.audit
            .record_best_effort(
                scope.organization_id,
                AuditOperation::RecordCreate,
                Some(entity_type),
                local_id,
                None,
                Some(payload),
                None,
            )
            .await;
        result.outcome = RecordOutcome::Created(vendor_id);
        Ok(result)
    }

    async fn link_vendor_id(
        &self,
        scope: &JobScope,
        entity_type: EntityType,
        mut record: Record,
        vendor_id: &str,
    ) -> Result<()> {
        record.insert(
            "vendor_id".to_string(),
            Value::String(vendor_id.to_string()),
        );
        self.stores
            .records
            .upsert(scope.organization_id, entity_type, record)
            .await
    }

    async fn pull_entity(
        self: &Arc<Self>,
        job: &mut SyncJob,
        entity_type: EntityType,
        scope: &JobScope,
        pause: &CancellationToken,
    ) -> Result<BatchFlow> {
        if job.mode == SyncMode::Selective {
            for vendor_id in job.selective_ids.clone() {
                if scope.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let result = self
                    .pull_one(scope, entity_type, &vendor_id)
                    .await?;
                apply_result(job, entity_type, result);
            }
            self.stores.jobs.update(job.clone()).await?;
            return Ok(BatchFlow::Continue);
        }

        let mut filters: Vec<(String, String)> = Vec::new();
        if job.mode == SyncMode::Incremental
            && let Some(since) = job.updated_since
        {
            filters.push((
                scope.profile.updated_since_param.clone(),
                since.to_rfc3339(),
            ));
        }

        let mut cursor: Option<String> = None;
        let mut page: u64 = 1;
        loop {
            if scope.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if pause.is_cancelled() {
                self.stores.jobs.update(job.clone()).await?;
                return Ok(BatchFlow::Paused);
            }

            let mut descriptor = RequestDescriptor::list(entity_type);
            for (key, value) in &filters {
                descriptor = descriptor.with_filter(key, value);
            }
            match &scope.profile.pagination {
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
                        .with_filter(size_param, &job.batch_size.to_string());
                }
            }

            let envelope = self
                .client
                .execute(scope.connection_id, &descriptor, &scope.cancel)
                .await?;
            if !envelope.success {
                // The client already absorbed retryable failures; a hard
                // failure here aborts this entity and moves on.
                job.errors.push(format!(
                    "{entity_type} pull failed: {}",
                    envelope.errors.join("; ")
                ));
                return Ok(BatchFlow::Continue);
            }

            let records = envelope.list_records(&scope.profile.list_key);
            let fetched = records.len();
            job.progress.entry(entity_type).or_default().total += fetched as u64;

            for raw in &records {
                let result = self.pull_record(scope, entity_type, raw).await?;
                apply_result(job, entity_type, result);
            }

            // Page boundary doubles as the batch boundary.
            self.stores.jobs.update(job.clone()).await?;

            match &scope.profile.pagination {
                PaginationStyle::Cursor { .. } => {
                    let pagination = envelope.pagination.unwrap_or_default();
                    if !pagination.has_more || pagination.next_cursor.is_none() {
                        break;
                    }
                    cursor = pagination.next_cursor;
                }
                PaginationStyle::PageNumber { .. } => {
                    if fetched < job.batch_size.max(1) {
                        break;
                    }
                    page += 1;
                }
            }
        }

        counter!(
            "vendorsync_records_synced_total",
            "entity_type" => entity_type.as_str(),
            "direction" => "pull",
        )
        .increment(job.progress.get(&entity_type).map(|p| p.succeeded).unwrap_or(0));
        Ok(BatchFlow::Continue)
    }

    async fn pull_one(
        self: &Arc<Self>,
        scope: &JobScope,
        entity_type: EntityType,
        vendor_id: &str,
    ) -> Result<RecordResult> {
        let descriptor = RequestDescriptor::get(entity_type, vendor_id);
        let envelope = self
            .client
            .execute(scope.connection_id, &descriptor, &scope.cancel)
            .await?;
        if !envelope.success {
            return Ok(RecordResult::new(RecordOutcome::Failed(format!(
                "{entity_type} {vendor_id}: {}",
                envelope.errors.join("; ")
            ))));
        }
        self.pull_record(scope, entity_type, &envelope.payload).await
    }

    /// Apply one remote record locally: create when unknown, otherwise
    /// diff non-system fields and resolve each disagreement per the job's
    /// conflict strategy.
    async fn pull_record(
        self: &Arc<Self>,
        scope: &JobScope,
        entity_type: EntityType,
        raw: &Value,
    ) -> Result<RecordResult> {
        let Some(raw_record) = raw.as_object() else {
            return Ok(RecordResult::new(RecordOutcome::Failed(format!(
                "{entity_type} pull returned a non-object record"
            ))));
        };

        let mapped = match self.mappings.map_from_vendor(entity_type, raw_record) {
            Ok(mapped) => mapped,
            Err(err @ Error::Validation { .. }) => {
                return Ok(RecordResult::new(RecordOutcome::Failed(err.to_string())));
            }
            Err(err) => return Err(err),
        };
        let mut result = RecordResult::new(RecordOutcome::Skipped);
        result.warnings = mapped.warnings;
        let mut incoming = mapped.record;

        let vendor_id = raw_record
            .get("id")
            .map(stringify_value)
            .or_else(|| incoming.get("vendor_id").map(stringify_value));
        if let Some(vendor_id) = &vendor_id {
            incoming.insert(
                "vendor_id".to_string(),
                Value::String(vendor_id.clone()),
            );
        }

        let local = match &vendor_id {
            Some(vendor_id) => {
                self.stores
                    .records
                    .find_by_field(
                        scope.organization_id,
                        entity_type,
                        "vendor_id",
                        &Value::String(vendor_id.clone()),
                    )
                    .await?
            }
            None => None,
        };

        let Some(local) = local else {
            if scope.dry_run {
                result
                    .warnings
                    .push(format!("{entity_type}: unknown locally, would create"));
                result.outcome = RecordOutcome::Succeeded;
                return Ok(result);
            }
            if !incoming.contains_key("id") {
                incoming.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            let local_id = incoming.get("id").map(stringify_value);
            self.stores
                .records
                .upsert(scope.organization_id, entity_type, incoming.clone())
                .await?;
            self.audit
                .record_best_effort(
                    scope.organization_id,
                    AuditOperation::RecordCreate,
                    Some(entity_type),
                    local_id.clone(),
                    None,
                    Some(Value::Object(incoming)),
                    None,
                )
                .await;
            result.outcome = RecordOutcome::Created(local_id);
            return Ok(result);
        };

        let fields = changed_fields(&local, &incoming);
        if fields.is_empty() {
            return Ok(result);
        }
        if scope.dry_run {
            result
                .warnings
                .push(format!("{entity_type}: {} field(s) would change", fields.len()));
            result.outcome = RecordOutcome::Succeeded;
            return Ok(result);
        }

        let local_id = local.get("id").map(stringify_value).unwrap_or_default();
        let local_ts = record_timestamp(&local, "updated_at");
        let remote_ts = record_timestamp(&incoming, "updated_at");

        let mut updated = local.clone();
        let mut applied_any = false;
        for field in fields {
            let local_value = local.get(&field).cloned().unwrap_or(Value::Null);
            let remote_value = incoming.get(&field).cloned().unwrap_or(Value::Null);
            let mut conflict = ConflictRecord::new(
                scope.organization_id,
                entity_type,
                &local_id,
                &field,
                local_value.clone(),
                remote_value.clone(),
                local_ts,
                remote_ts,
                scope.strategy,
            );

            let winner = pick_winner(scope.strategy, &local_value, &remote_value, local_ts, remote_ts);

            match winner {
                Some(value) => {
                    conflict.resolve(value.clone());
                    self.stores.conflicts.insert(conflict).await?;
                    if value != local_value {
                        match value {
                            Value::Null => {
                                updated.remove(&field);
                            }
                            value => {
                                updated.insert(field.clone(), value);
                            }
                        }
                        applied_any = true;
                    }
                }
                None => {
                    self.stores.conflicts.insert(conflict).await?;
                    result.warnings.push(format!(
                        "{entity_type} {local_id}: field '{field}' queued for manual review"
                    ));
                }
            }
        }

        if applied_any {
            if let Some(ts) = incoming.get("updated_at").cloned() {
                updated.insert("updated_at".to_string(), ts);
            }
            self.stores
                .records
                .upsert(scope.organization_id, entity_type, updated.clone())
                .await?;
            self.audit
                .record_best_effort(
                    scope.organization_id,
                    AuditOperation::RecordUpdate,
                    Some(entity_type),
                    Some(local_id),
                    Some(Value::Object(local)),
                    Some(Value::Object(updated)),
                    None,
                )
                .await;
            result.outcome = RecordOutcome::Succeeded;
        }
        Ok(result)
    }

    /// Push one local record outside a job, used by reconciliation fixes.
    pub async fn push_single(
        self: &Arc<Self>,
        organization_id: Uuid,
        connection_id: Uuid,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<()> {
        let record = self
            .stores
            .records
            .get(organization_id, entity_type, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {local_id}")))?;
        let scope = self.single_scope(organization_id, connection_id).await?;

        let result = self.push_record(&scope, entity_type, record).await?;
        match result.outcome {
            RecordOutcome::Failed(message) => Err(Error::Internal(message)),
            _ => Ok(()),
        }
    }

    /// Pull one vendor record outside a job, used by reconciliation fixes.
    pub async fn pull_single(
        self: &Arc<Self>,
        organization_id: Uuid,
        connection_id: Uuid,
        entity_type: EntityType,
        vendor_id: &str,
    ) -> Result<()> {
        let scope = self.single_scope(organization_id, connection_id).await?;
        let result = self.pull_one(&scope, entity_type, vendor_id).await?;
        match result.outcome {
            RecordOutcome::Failed(message) => Err(Error::Internal(message)),
            _ => Ok(()),
        }
    }

    /// Apply a human decision to a queued manual-review conflict: write the
    /// chosen value to the local record, mark the conflict resolved, and
    /// leave an audit trail.
    pub async fn resolve_conflict(&self, conflict_id: Uuid, chosen: Value) -> Result<()> {
        let conflict = self
            .stores
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.resolved {
            return Err(Error::Conflict {
                entity_type: conflict.entity_type,
                field: conflict.field,
            });
        }

        let record = self
            .stores
            .records
            .get(conflict.organization_id, conflict.entity_type, &conflict.entity_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{} {}", conflict.entity_type, conflict.entity_id))
            })?;

        let mut updated = record.clone();
        match chosen.clone() {
            Value::Null => {
                updated.remove(&conflict.field);
            }
            value => {
                updated.insert(conflict.field.clone(), value);
            }
        }
        self.stores
            .records
            .upsert(conflict.organization_id, conflict.entity_type, updated.clone())
            .await?;
        self.stores.conflicts.resolve(conflict_id, chosen).await?;
        self.audit
            .record_best_effort(
                conflict.organization_id,
                AuditOperation::ConflictResolution,
                Some(conflict.entity_type),
                Some(conflict.entity_id.clone()),
                Some(Value::Object(record)),
                Some(Value::Object(updated)),
                None,
            )
            .await;
        info!(
            %conflict_id,
            entity_type = %conflict.entity_type,
            field = %conflict.field,
            "conflict resolved"
        );
        Ok(())
    }

    async fn single_scope(
        &self,
        organization_id: Uuid,
        connection_id: Uuid,
    ) -> Result<JobScope> {
        let connection = self.connections.get(connection_id).await?;
        let profile = self.vendors.get(&connection.vendor)?.clone();
        let config = self.org_config(organization_id);
        Ok(JobScope {
            organization_id,
            connection_id,
            profile,
            strategy: config.conflict_strategy,
            dry_run: false,
            cancel: CancellationToken::new(),
        })
    }
}

/// Pick the winning value for one conflicting field, or `None` when the
/// strategy defers to a human. Under `newest_wins`, missing timestamps
/// default the win to the remote side; the vendor is the system of record
/// for ambiguous data.
fn pick_winner(
    strategy: ConflictStrategy,
    local_value: &Value,
    remote_value: &Value,
    local_ts: Option<DateTime<Utc>>,
    remote_ts: Option<DateTime<Utc>>,
) -> Option<Value> {
    match strategy {
        ConflictStrategy::RemoteWins => Some(remote_value.clone()),
        ConflictStrategy::LocalWins => Some(local_value.clone()),
        ConflictStrategy::NewestWins => match (local_ts, remote_ts) {
            (Some(local_ts), Some(remote_ts)) if local_ts > remote_ts => {
                Some(local_value.clone())
            }
            _ => Some(remote_value.clone()),
        },
        ConflictStrategy::ManualReview => None,
    }
}

fn apply_result(job: &mut SyncJob, entity_type: EntityType, result: RecordResult) {
    let progress = job.progress.entry(entity_type).or_default();
    progress.processed += 1;
    match result.outcome {
        RecordOutcome::Succeeded => progress.succeeded += 1,
        RecordOutcome::Created(vendor_or_local_id) => {
            progress.succeeded += 1;
            if let Some(id) = vendor_or_local_id {
                job.created_records.push(format!("{entity_type}:{id}"));
            }
        }
        RecordOutcome::Skipped => progress.skipped += 1,
        RecordOutcome::Failed(message) => {
            progress.failed += 1;
            job.errors.push(format!("{entity_type}: {message}"));
        }
    }
    job.warnings.extend(result.warnings);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_slot_releases_on_drop() {
        let slots = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let org = Uuid::new_v4();

        slots.lock().unwrap().insert(org);
        let slot = OrgSlot {
            organization_id: org,
            slots: slots.clone(),
        };
        assert!(slots.lock().unwrap().contains(&org));

        drop(slot);
        assert!(!slots.lock().unwrap().contains(&org));
    }

    #[test]
    fn apply_result_updates_progress_and_errors() {
        let request = SyncJobRequest {
            organization_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            entity_types: vec![EntityType::Tenant],
            direction: SyncDirection::Push,
            mode: SyncMode::Full,
            dry_run: false,
            selective_ids: vec![],
            updated_since: None,
        };
        let mut job = SyncJob::from_request(request, 100, ConflictStrategy::NewestWins);

        apply_result(
            &mut job,
            EntityType::Tenant,
            RecordResult::new(RecordOutcome::Succeeded),
        );
        apply_result(
            &mut job,
            EntityType::Tenant,
            RecordResult::new(RecordOutcome::Failed("boom".into())),
        );
        apply_result(
            &mut job,
            EntityType::Tenant,
            RecordResult::new(RecordOutcome::Skipped),
        );
        apply_result(
            &mut job,
            EntityType::Tenant,
            RecordResult::new(RecordOutcome::Created(Some("v-9".into()))),
        );

        let progress = job.progress[&EntityType::Tenant];
        assert_eq!(progress.processed, 4);
        assert_eq!(progress.succeeded, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(job.errors, vec!["tenant: boom".to_string()]);
        assert_eq!(job.created_records, vec!["tenant:v-9".to_string()]);
    }

    #[test]
    fn newest_wins_defaults_to_remote_without_both_timestamps() {
        let local = Value::String("local".into());
        let remote = Value::String("remote".into());
        let older = Utc::now() - chrono::Duration::hours(2);
        let newer = Utc::now();

        let won = pick_winner(
            ConflictStrategy::NewestWins,
            &local,
            &remote,
            Some(newer),
            Some(older),
        );
        assert_eq!(won, Some(local.clone()));

        // Ties and missing timestamps fall to the remote side.
        for (local_ts, remote_ts) in [
            (Some(older), Some(newer)),
            (Some(older), Some(older)),
            (None, Some(newer)),
            (Some(newer), None),
            (None, None),
        ] {
            let won = pick_winner(
                ConflictStrategy::NewestWins,
                &local,
                &remote,
                local_ts,
                remote_ts,
            );
            assert_eq!(won, Some(remote.clone()));
        }

        assert_eq!(
            pick_winner(ConflictStrategy::ManualReview, &local, &remote, None, None),
            None
        );
    }
}
