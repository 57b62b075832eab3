//! Job store — claim, log, complete and reconcile jobs over a [`JobDatabase`].
//!
//! Every mutation is a conditional write on `version`. Precondition failures
//! are contention and go straight back to the caller; transient backend
//! failures are retried with exponential backoff.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{DatabaseError, StoreErrorKind};
use crate::jobs::{Job, JobStatus, JobType, LogEntry, LogLevel, NewJob, ResultType};
use crate::store::traits::{JobDatabase, JobPage, JobUpdate, UpdateCondition};

/// Contention retries for a CAS-protected `child_jobs` append.
pub const MAX_APPEND_ATTEMPTS: u32 = 5;

/// Contention retries for a log write before the entry is left in memory only.
pub const MAX_LOG_ATTEMPTS: u32 = 5;

/// Versioned job operations shared by workers, handlers and the job tree.
pub struct JobStore {
    db: Arc<dyn JobDatabase>,
    retry: RetryPolicy,
    default_timeout_seconds: u64,
}

impl JobStore {
    pub fn new(db: Arc<dyn JobDatabase>, retry: RetryPolicy) -> Self {
        Self {
            db,
            retry,
            default_timeout_seconds: 3600,
        }
    }

    /// Timeout given to submitted jobs that do not carry one.
    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    /// Get access to the backend.
    pub fn database(&self) -> &Arc<dyn JobDatabase> {
        &self.db
    }

    /// Run `op`, retrying transient failures with `base_delay * 2^attempt` backoff.
    async fn with_retry<T, F, Fut>(&self, op: &str, job_id: &str, mut f: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == StoreErrorKind::Transient && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        op,
                        job_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.kind() == StoreErrorKind::Transient {
                        error!(op, job_id, retries = attempt, error = %e, "Store retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Strongly consistent read of one job.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, DatabaseError> {
        let db = self.db.as_ref();
        self.with_retry("get_job", job_id, move || db.get_job(job_id))
            .await
    }

    /// Oldest PENDING job, re-read for a consistent view.
    pub async fn find_pending_job(&self) -> Result<Option<Job>, DatabaseError> {
        let candidates = self.db.query_by_status(JobStatus::Pending, &[], 1).await?;
        match candidates.into_iter().next() {
            Some(candidate) => self.get_job(&candidate.job_id).await,
            None => Ok(None),
        }
    }

    /// Up to `limit` oldest PROCESSING jobs that are waiting on an external batch.
    pub async fn find_batch_status_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let candidates = self
            .db
            .query_by_status(JobStatus::Processing, JobType::batch_await_types(), limit)
            .await?;

        let mut jobs = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(job) = self.get_job(&candidate.job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Most recent jobs, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        self.db.list_jobs(status, limit).await
    }

    /// Jobs for a conversation, newest first.
    pub async fn jobs_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        self.db.query_by_conversation(conversation_id, limit).await
    }

    /// One page of jobs sharing `root_job_id`.
    pub async fn jobs_for_root(
        &self,
        root_job_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<JobPage, DatabaseError> {
        self.db.query_by_root(root_job_id, cursor, limit).await
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert a PENDING job at version 1, resolving `root_job_id` from the parent.
    pub async fn submit_job(&self, mut new_job: NewJob) -> Result<Job, DatabaseError> {
        if new_job.root_job_id.is_none() {
            if let Some(parent_id) = new_job.parent_job_id.clone() {
                let parent = self
                    .get_job(&parent_id)
                    .await?
                    .ok_or(DatabaseError::NotFound {
                        entity: "parent job".to_string(),
                        id: parent_id,
                    })?;
                new_job.root_job_id = Some(parent.root_job_id);
            }
        }

        let job = new_job.into_job(self.default_timeout_seconds);
        let db = self.db.as_ref();
        let job_ref = &job;
        self.with_retry("submit_job", &job.job_id, move || db.insert_job(job_ref))
            .await?;

        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            conversation_id = %job.conversation_id,
            "Job submitted"
        );
        Ok(job)
    }

    /// Claim `job` for `worker_id`.
    ///
    /// A normal claim requires the stored status and version to match and moves
    /// the job to PROCESSING. A batch check only requires the version and keeps
    /// the status. Returns `None` when another worker won the race or the store
    /// stayed unavailable; neither is an error for the caller.
    pub async fn claim_job(&self, job: &Job, worker_id: &str, is_batch_check: bool) -> Option<Job> {
        let now = Utc::now();
        let (update, condition) = if is_batch_check {
            (
                JobUpdate {
                    worker_id: Some(worker_id.to_string()),
                    batch_check_time: Some(now),
                    ..Default::default()
                },
                UpdateCondition::version(job.version),
            )
        } else {
            (
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    started_at: Some(now),
                    worker_id: Some(worker_id.to_string()),
                    ..Default::default()
                },
                UpdateCondition::version_and_status(job.version, job.status),
            )
        };

        let db = self.db.as_ref();
        let job_id = job.job_id.as_str();
        let update_ref = &update;
        let result = self
            .with_retry("claim_job", job_id, move || {
                db.conditional_update(job_id, update_ref, condition)
            })
            .await;

        match result {
            Ok(()) => {
                let mut claimed = job.clone();
                claimed.version = job.version + 1;
                claimed.worker_id = Some(worker_id.to_string());
                claimed.updated_at = now;
                if is_batch_check {
                    claimed.batch_check_time = Some(now);
                } else {
                    claimed.status = JobStatus::Processing;
                    claimed.started_at = Some(now);
                }
                info!(job_id, worker_id, is_batch_check, version = claimed.version, "Job claimed");
                Some(claimed)
            }
            Err(e) if e.kind() == StoreErrorKind::Contention => {
                debug!(job_id, worker_id, "Job already claimed by another worker");
                None
            }
            Err(e) => {
                error!(job_id, worker_id, error = %e, "Failed to claim job");
                None
            }
        }
    }

    /// Append a log entry to `job` and persist the full log array.
    ///
    /// If another writer bumped the row since `job` was read, the live log is
    /// re-read and merged with ours, `job` adopts the live version, and the
    /// write is retried. `job.status` is left alone so callers can still see
    /// that the row changed under them.
    pub async fn update_job_logs(
        &self,
        job: &mut Job,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Result<(), DatabaseError> {
        job.logs.push(LogEntry::new(level, message));

        let mut attempt = 0;
        loop {
            let update = JobUpdate {
                logs: Some(job.logs.clone()),
                ..Default::default()
            };
            match self.apply(job, "update_job_logs", update).await {
                Err(e) if e.kind() == StoreErrorKind::Contention && attempt + 1 < MAX_LOG_ATTEMPTS => {
                    let Some(live) = self.get_job(&job.job_id).await? else {
                        return Err(e);
                    };
                    debug!(
                        job_id = %job.job_id,
                        attempt,
                        live_version = live.version,
                        "Log write lost a race, merging with live log"
                    );
                    job.version = live.version;
                    job.logs = merge_logs(live.logs, &job.logs);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Write the terminal status and the `job_results` document.
    pub async fn complete_job(
        &self,
        job: &mut Job,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let results = build_job_results(success, now, result, error);

        let update = JobUpdate {
            status: Some(status),
            completed_at: Some(now),
            job_results: Some(results.clone()),
            ..Default::default()
        };
        self.apply(job, "complete_job", update).await?;

        job.status = status;
        job.completed_at = Some(now);
        job.job_results = Some(results);
        info!(job_id = %job.job_id, status = %status, version = job.version, "Job completed");
        Ok(())
    }

    /// Write `job_results` without touching `status`.
    ///
    /// Used when the spawned process changed the job's status directly; the
    /// live row is re-read so the write is conditioned on its current version.
    pub async fn preserve_job_status(
        &self,
        job: &mut Job,
        results: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let live = self
            .get_job(&job.job_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "job".to_string(),
                id: job.job_id.clone(),
            })?;

        job.version = live.version;
        job.status = live.status;

        let update = JobUpdate {
            job_results: Some(results.clone()),
            ..Default::default()
        };
        self.apply(job, "preserve_job_status", update).await?;

        job.job_results = Some(results);
        info!(
            job_id = %job.job_id,
            status = %job.status,
            version = job.version,
            "Preserved externally-set job status"
        );
        Ok(())
    }

    /// Append `child_id` to the parent's `child_jobs` under a version check.
    ///
    /// On contention the parent is re-read and the append retried. Appending
    /// an id that is already present is a no-op.
    pub async fn append_child_job(&self, parent_id: &str, child_id: &str) -> Result<Job, DatabaseError> {
        let mut attempt = 0;
        loop {
            let mut parent = self
                .get_job(parent_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "job".to_string(),
                    id: parent_id.to_string(),
                })?;

            if parent.child_jobs.iter().any(|c| c == child_id) {
                return Ok(parent);
            }

            let mut children = parent.child_jobs.clone();
            children.push(child_id.to_string());
            let update = JobUpdate {
                child_jobs: Some(children.clone()),
                ..Default::default()
            };

            match self.apply(&mut parent, "append_child_job", update).await {
                Ok(()) => {
                    parent.child_jobs = children;
                    return Ok(parent);
                }
                Err(e) if e.kind() == StoreErrorKind::Contention && attempt + 1 < MAX_APPEND_ATTEMPTS => {
                    debug!(parent_id, child_id, attempt, "child_jobs append lost a race, re-reading");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Conditional write on `job.version`; bumps the in-memory version on success.
    async fn apply(&self, job: &mut Job, op: &str, update: JobUpdate) -> Result<(), DatabaseError> {
        let db = self.db.as_ref();
        let job_id = job.job_id.as_str();
        let condition = UpdateCondition::version(job.version);
        let update_ref = &update;
        self.with_retry(op, job_id, move || {
            db.conditional_update(job_id, update_ref, condition)
        })
        .await?;

        job.version += 1;
        job.updated_at = Utc::now();
        Ok(())
    }
}

/// `live` followed by any of `ours` it lacks, in timestamp order.
fn merge_logs(live: Vec<LogEntry>, ours: &[LogEntry]) -> Vec<LogEntry> {
    let mut merged = live;
    for entry in ours {
        if !merged.contains(entry) {
            merged.push(entry.clone());
        }
    }
    merged.sort_by_key(|entry| entry.timestamp);
    merged
}

/// The `job_results` document written on completion.
fn build_job_results(
    success: bool,
    completed_at: chrono::DateTime<Utc>,
    result: Option<serde_json::Value>,
    error: Option<&str>,
) -> serde_json::Value {
    let result_type = if success {
        ResultType::Success
    } else {
        ResultType::Failure
    };

    let mut doc = serde_json::Map::new();
    doc.insert(
        "result_type".into(),
        serde_json::to_value(result_type).unwrap_or_default(),
    );
    doc.insert(
        "completed_at".into(),
        serde_json::Value::String(completed_at.to_rfc3339()),
    );
    match result {
        Some(serde_json::Value::Object(map)) => {
            for (k, v) in map {
                if k != "result_type" && k != "completed_at" {
                    doc.insert(k, v);
                }
            }
        }
        Some(serde_json::Value::Null) | None => {}
        Some(other) => {
            doc.insert("result".into(), other);
        }
    }
    if let Some(error) = error {
        doc.insert("error".into(), serde_json::Value::String(error.to_string()));
    }
    serde_json::Value::Object(doc)
}
