//! Job entity, status/type enums, and the column-level record used by the store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED are never left by the worker path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(JobError::InvalidStatus(s.to_string())),
        }
    }
}

/// Kind of work a job represents.
///
/// The tag set is open: unrecognised strings parse to [`JobType::FullPipeline`]
/// instead of failing, so rows written by newer submitters still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    #[default]
    FullPipeline,
    /// Legacy tag; meaning depends on status (PENDING creates, PROCESSING awaits).
    NarrativeBatch,
    CreateNarrativeBatch,
    /// Also accepted as `BATCH_STATUS_CHECK`.
    AwaitingNarrativeBatch,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullPipeline => "FULL_PIPELINE",
            JobType::NarrativeBatch => "NARRATIVE_BATCH",
            JobType::CreateNarrativeBatch => "CREATE_NARRATIVE_BATCH",
            JobType::AwaitingNarrativeBatch => "AWAITING_NARRATIVE_BATCH",
        }
    }

    /// Parse a stored tag, falling back to the default type.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL_PIPELINE" => JobType::FullPipeline,
            "NARRATIVE_BATCH" => JobType::NarrativeBatch,
            "CREATE_NARRATIVE_BATCH" => JobType::CreateNarrativeBatch,
            "AWAITING_NARRATIVE_BATCH" | "BATCH_STATUS_CHECK" => JobType::AwaitingNarrativeBatch,
            _ => JobType::default(),
        }
    }

    /// Types a PROCESSING job can carry while it waits on an external batch.
    pub fn batch_await_types() -> &'static [JobType] {
        &[JobType::AwaitingNarrativeBatch, JobType::NarrativeBatch]
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        JobType::parse(&s)
    }
}

impl From<JobType> for String {
    fn from(t: JobType) -> Self {
        t.as_str().to_string()
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        })
    }
}

/// One line of a job's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Outcome tag written into `job_results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    Success,
    Failure,
}

/// A unit of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub conversation_id: String,
    pub report_id: Option<String>,
    pub status: JobStatus,
    pub job_type: JobType,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub version: i64,
    pub logs: Vec<LogEntry>,
    pub job_config: serde_json::Value,
    pub job_results: Option<serde_json::Value>,
    pub batch_id: Option<String>,
    pub batch_job_id: Option<String>,
    pub batch_check_time: Option<DateTime<Utc>>,
    pub parent_job_id: Option<String>,
    pub root_job_id: String,
    pub job_stage: Option<String>,
    pub child_jobs: Vec<String>,
    pub timeout_seconds: u64,
    pub environment: BTreeMap<String, String>,
}

impl Job {
    /// Stage config for `stage`, from `job_config.stages[*]`.
    pub fn stage_config(&self, stage: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.job_config
            .get("stages")?
            .as_array()?
            .iter()
            .find(|s| s.get("stage").and_then(|v| v.as_str()) == Some(stage))?
            .get("config")?
            .as_object()
    }

    /// Look `key` up in the named stage's config, then at the top level of `job_config`.
    pub fn config_value(&self, stage: &str, key: &str) -> Option<&serde_json::Value> {
        self.stage_config(stage)
            .and_then(|c| c.get(key))
            .or_else(|| self.job_config.get(key))
            .filter(|v| !v.is_null())
    }

    /// `report_id`, or the conversation id when the job has none.
    pub fn report_id_or_conversation(&self) -> &str {
        self.report_id.as_deref().unwrap_or(&self.conversation_id)
    }
}

/// Parameters for submitting a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Generated when absent.
    pub job_id: Option<String>,
    pub conversation_id: String,
    pub report_id: Option<String>,
    pub job_type: JobType,
    pub priority: i64,
    pub job_config: Option<serde_json::Value>,
    pub batch_id: Option<String>,
    pub batch_job_id: Option<String>,
    pub parent_job_id: Option<String>,
    /// Normally left empty so the store resolves it from the parent.
    pub root_job_id: Option<String>,
    pub job_stage: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub environment: BTreeMap<String, String>,
}

impl NewJob {
    pub fn new(conversation_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            job_type,
            ..Default::default()
        }
    }

    /// Materialize a PENDING job at version 1. `root_job_id` must already be resolved
    /// (or left `None`, in which case the job is its own root).
    pub fn into_job(self, default_timeout_seconds: u64) -> Job {
        let now = Utc::now();
        let job_id = self.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let root_job_id = self.root_job_id.unwrap_or_else(|| job_id.clone());
        Job {
            job_id,
            conversation_id: self.conversation_id,
            report_id: self.report_id,
            status: JobStatus::Pending,
            job_type: self.job_type,
            priority: self.priority,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            version: 1,
            logs: Vec::new(),
            job_config: self
                .job_config
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            job_results: None,
            batch_id: self.batch_id,
            batch_job_id: self.batch_job_id,
            batch_check_time: None,
            parent_job_id: self.parent_job_id,
            root_job_id,
            job_stage: self.job_stage,
            child_jobs: Vec::new(),
            timeout_seconds: self.timeout_seconds.unwrap_or(default_timeout_seconds),
            environment: self.environment,
        }
    }
}

/// Column-level representation of a [`Job`] as the store keeps it.
///
/// Timestamps are RFC 3339 text; `logs`, `job_config`, `job_results`,
/// `child_jobs` and `environment` are JSON-encoded sub-documents.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub conversation_id: String,
    pub report_id: Option<String>,
    pub status: String,
    pub job_type: String,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub worker_id: Option<String>,
    pub version: i64,
    pub logs: String,
    pub job_config: String,
    pub job_results: Option<String>,
    pub batch_id: Option<String>,
    pub batch_job_id: Option<String>,
    pub batch_check_time: Option<String>,
    pub parent_job_id: Option<String>,
    pub root_job_id: String,
    pub job_stage: Option<String>,
    pub child_jobs: String,
    pub timeout_seconds: i64,
    pub environment: String,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            conversation_id: job.conversation_id.clone(),
            report_id: job.report_id.clone(),
            status: job.status.as_str().to_string(),
            job_type: job.job_type.as_str().to_string(),
            priority: job.priority,
            created_at: format_timestamp(&job.created_at),
            updated_at: format_timestamp(&job.updated_at),
            started_at: job.started_at.map(|d| format_timestamp(&d)),
            completed_at: job.completed_at.map(|d| format_timestamp(&d)),
            worker_id: job.worker_id.clone(),
            version: job.version,
            logs: encode_json(&job.logs),
            job_config: job.job_config.to_string(),
            job_results: job.job_results.as_ref().map(|v| v.to_string()),
            batch_id: job.batch_id.clone(),
            batch_job_id: job.batch_job_id.clone(),
            batch_check_time: job.batch_check_time.map(|d| format_timestamp(&d)),
            parent_job_id: job.parent_job_id.clone(),
            root_job_id: job.root_job_id.clone(),
            job_stage: job.job_stage.clone(),
            child_jobs: encode_json(&job.child_jobs),
            timeout_seconds: job.timeout_seconds as i64,
            environment: encode_json(&job.environment),
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = JobError;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        let id = r.job_id.clone();
        let doc_err = |field: &'static str| {
            let id = id.clone();
            move |e: serde_json::Error| JobError::InvalidDocument {
                id,
                field,
                reason: e.to_string(),
            }
        };

        Ok(Job {
            status: r.status.parse()?,
            job_type: JobType::parse(&r.job_type),
            priority: r.priority,
            created_at: parse_timestamp(&r.created_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
            updated_at: parse_timestamp(&r.updated_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
            started_at: r.started_at.as_deref().and_then(parse_timestamp),
            completed_at: r.completed_at.as_deref().and_then(parse_timestamp),
            worker_id: r.worker_id,
            version: r.version,
            logs: decode_json_or_default(&r.logs).map_err(doc_err("logs"))?,
            job_config: decode_json_or_default(&r.job_config).map_err(doc_err("job_config"))?,
            job_results: r
                .job_results
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()
                .map_err(doc_err("job_results"))?,
            batch_id: r.batch_id,
            batch_job_id: r.batch_job_id,
            batch_check_time: r.batch_check_time.as_deref().and_then(parse_timestamp),
            parent_job_id: r.parent_job_id,
            root_job_id: if r.root_job_id.is_empty() {
                r.job_id.clone()
            } else {
                r.root_job_id
            },
            job_stage: r.job_stage,
            child_jobs: decode_json_or_default(&r.child_jobs).map_err(doc_err("child_jobs"))?,
            timeout_seconds: r.timeout_seconds.max(0) as u64,
            environment: decode_json_or_default(&r.environment)
                .map_err(doc_err("environment"))?,
            job_id: r.job_id,
            conversation_id: r.conversation_id,
            report_id: r.report_id,
        })
    }
}

/// Fixed-width UTC encoding so stored timestamps sort lexically.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp, or an epoch-seconds integer written by older submitters.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn encode_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn decode_json_or_default<T>(s: &str) -> Result<T, serde_json::Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    if s.trim().is_empty() {
        Ok(T::default())
    } else {
        serde_json::from_str(s)
    }
}
