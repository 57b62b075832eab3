//! Backend-agnostic job persistence trait.
//!
//! The backend only knows how to read rows and apply a targeted conditional
//! write. Retry policy, log bookkeeping and claim semantics live one level
//! up in [`crate::store::JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus, JobType, LogEntry};

/// Columns a conditional write may touch. `None` leaves a column alone.
///
/// Every successful write also sets `updated_at` and bumps `version` to
/// `expected_version + 1`.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub batch_check_time: Option<DateTime<Utc>>,
    pub logs: Option<Vec<LogEntry>>,
    pub job_results: Option<serde_json::Value>,
    pub child_jobs: Option<Vec<String>>,
}

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCondition {
    pub expected_version: i64,
    /// Also require this stored status.
    pub expected_status: Option<JobStatus>,
}

impl UpdateCondition {
    pub fn version(expected_version: i64) -> Self {
        Self {
            expected_version,
            expected_status: None,
        }
    }

    pub fn version_and_status(expected_version: i64, status: JobStatus) -> Self {
        Self {
            expected_version,
            expected_status: Some(status),
        }
    }
}

/// One page of a lineage query.
#[derive(Debug, Clone, Default)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Pass back to continue; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Persistence backend for job rows.
#[async_trait]
pub trait JobDatabase: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a new job. Fails with `Constraint` if the id is taken.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Strongly consistent read by primary key.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Oldest-first scan of the (status, created_at) index, optionally filtered by type.
    async fn query_by_status(
        &self,
        status: JobStatus,
        job_types: &[JobType],
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Page through the root_job_id index, ordered by job_id.
    async fn query_by_root(
        &self,
        root_job_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<JobPage, DatabaseError>;

    /// Jobs for a conversation, newest first.
    async fn query_by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Most recent jobs, newest first.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Apply `update` only if `condition` holds. A failed precondition returns
    /// `ConditionFailed` and leaves the row untouched.
    async fn conditional_update(
        &self,
        job_id: &str,
        update: &JobUpdate,
        condition: UpdateCondition,
    ) -> Result<(), DatabaseError>;
}
