//! Polling of submitted narrative batches.

use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::handlers::handler::{Handler, command_prefix};
use crate::jobs::{Job, JobStatus, JobType};

/// Checks on an external batch.
///
/// Matches `AWAITING_NARRATIVE_BATCH`, and the legacy `NARRATIVE_BATCH` tag
/// once the job is PROCESSING.
pub struct BatchStatusHandler {
    command: Vec<String>,
}

impl BatchStatusHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            command: config.batch_status_command.clone(),
        }
    }
}

impl Handler for BatchStatusHandler {
    fn name(&self) -> &'static str {
        "batch_status"
    }

    fn can_handle(&self, job: &Job) -> bool {
        match job.job_type {
            JobType::AwaitingNarrativeBatch => true,
            JobType::NarrativeBatch => job.status == JobStatus::Processing,
            _ => false,
        }
    }

    fn build_command(&self, job: &Job) -> Result<Vec<String>, HandlerError> {
        let mut cmd = command_prefix(self.name(), &self.command)?;
        // The job that created the batch owns its metadata.
        let target = job
            .batch_job_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&job.job_id);
        cmd.push(format!("--job-id={target}"));
        Ok(cmd)
    }
}
