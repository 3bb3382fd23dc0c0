//! Sync job model
//!
//! One synchronization run: direction, mode, per-entity progress counters,
//! and the accumulated errors/warnings a caller inspects afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    Selective,
}

/// Job lifecycle: `pending → running → {completed|failed|cancelled}`, with
/// `paused` reachable from `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// How a field-level conflict discovered during pull is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    RemoteWins,
    LocalWins,
    NewestWins,
    ManualReview,
}

/// Progress counters for one entity type within a job. Updated only at
/// batch boundaries, so they are monotonically non-decreasing when observed
/// from another task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// One synchronization run over a set of entity types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub direction: SyncDirection,
    pub mode: SyncMode,
    pub status: JobStatus,
    pub batch_size: usize,
    pub conflict_strategy: ConflictStrategy,
    /// Perform mapping and lookups but skip every mutating vendor call.
    pub dry_run: bool,
    /// Entity ids this job is scoped to, for `selective` mode.
    pub selective_ids: Vec<String>,
    /// `incremental` mode pulls records updated after this watermark.
    pub updated_since: Option<DateTime<Utc>>,
    pub progress: BTreeMap<EntityType, EntityProgress>,
    /// Ids of records created by this job, as `entity_type:id`. Push
    /// entries carry the vendor-assigned id, pull entries the local one.
    #[serde(default)]
    pub created_records: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a job; everything else is defaulted from the
/// organization's sync config.
#[derive(Debug, Clone)]
pub struct SyncJobRequest {
    pub organization_id: Uuid,
    pub connection_id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub direction: SyncDirection,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub selective_ids: Vec<String>,
    pub updated_since: Option<DateTime<Utc>>,
}

impl SyncJob {
    pub fn from_request(
        request: SyncJobRequest,
        batch_size: usize,
        conflict_strategy: ConflictStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: request.organization_id,
            connection_id: request.connection_id,
            entity_types: request.entity_types,
            direction: request.direction,
            mode: request.mode,
            status: JobStatus::Pending,
            batch_size,
            conflict_strategy,
            dry_run: request.dry_run,
            selective_ids: request.selective_ids,
            updated_since: request.updated_since,
            progress: BTreeMap::new(),
            created_records: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Roll the per-entity counters up into one [`SyncOutcome`].
    pub fn outcome(&self) -> SyncOutcome {
        let mut outcome = self
            .progress
            .values()
            .fold(SyncOutcome::default(), |acc, progress| {
                acc.merge(SyncOutcome {
                    success_count: progress.succeeded,
                    failure_count: progress.failed,
                    skipped_count: progress.skipped,
                    ..SyncOutcome::default()
                })
            });
        outcome.created_records = self.created_records.clone();
        outcome.errors = self.errors.clone();
        outcome.warnings = self.warnings.clone();
        outcome
    }
}

/// Aggregated outcome of one direction of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    /// `entity_type:id` entries for records the run created.
    pub created_records: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncOutcome {
    /// Merge the push and pull halves of a bidirectional run: counts sum,
    /// lists concatenate.
    pub fn merge(mut self, other: SyncOutcome) -> SyncOutcome {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.skipped_count += other.skipped_count;
        self.created_records.extend(other.created_records);
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Cancelled));

        assert!(!Completed.can_transition(Running));
        assert!(!Pending.can_transition(Completed));
        assert!(!Cancelled.can_transition(Running));
        assert!(Completed.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn job_outcome_rolls_up_entity_progress() {
        let request = SyncJobRequest {
            organization_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            entity_types: vec![EntityType::Tenant, EntityType::Payment],
            direction: SyncDirection::Push,
            mode: SyncMode::Full,
            dry_run: false,
            selective_ids: vec![],
            updated_since: None,
        };
        let mut job = SyncJob::from_request(request, 100, ConflictStrategy::NewestWins);
        job.progress.insert(
            EntityType::Tenant,
            EntityProgress {
                total: 3,
                processed: 3,
                succeeded: 2,
                failed: 1,
                skipped: 0,
            },
        );
        job.progress.insert(
            EntityType::Payment,
            EntityProgress {
                total: 2,
                processed: 2,
                succeeded: 1,
                failed: 0,
                skipped: 1,
            },
        );
        job.created_records.push("tenant:v-1".into());
        job.errors.push("tenant: boom".into());

        let outcome = job.outcome();
        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.skipped_count, 1);
        assert_eq!(outcome.created_records, vec!["tenant:v-1".to_string()]);
        assert_eq!(outcome.errors, vec!["tenant: boom".to_string()]);
    }

    #[test]
    fn outcome_merge_sums_counts_and_concatenates_lists() {
        let push = SyncOutcome {
            success_count: 3,
            failure_count: 1,
            skipped_count: 0,
            created_records: vec!["v-1".into()],
            errors: vec!["tenant t-9: boom".into()],
            warnings: vec![],
        };
        let pull = SyncOutcome {
            success_count: 2,
            failure_count: 0,
            skipped_count: 1,
            created_records: vec![],
            errors: vec![],
            warnings: vec!["unknown transform".into()],
        };

        let merged = push.merge(pull);
        assert_eq!(merged.success_count, 5);
        assert_eq!(merged.failure_count, 1);
        assert_eq!(merged.skipped_count, 1);
        assert_eq!(merged.created_records, vec!["v-1".to_string()]);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.warnings.len(), 1);
    }
}
