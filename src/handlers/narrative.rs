//! Narrative batch submission.

use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::handlers::handler::{Handler, command_prefix, config_arg};
use crate::jobs::{Job, JobStatus, JobType};

const NARRATIVE_STAGE: &str = "NARRATIVE_BATCH";

/// Submits narrative report batches.
///
/// Matches `CREATE_NARRATIVE_BATCH`, and the legacy `NARRATIVE_BATCH` tag
/// while the job is still PENDING.
pub struct NarrativeBatchHandler {
    command: Vec<String>,
    default_model: String,
    default_max_batch_size: u64,
}

impl NarrativeBatchHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            command: config.narrative_batch_command.clone(),
            default_model: config.default_model.clone(),
            default_max_batch_size: config.default_max_batch_size,
        }
    }
}

impl Handler for NarrativeBatchHandler {
    fn name(&self) -> &'static str {
        "narrative_batch"
    }

    fn can_handle(&self, job: &Job) -> bool {
        match job.job_type {
            JobType::CreateNarrativeBatch => true,
            JobType::NarrativeBatch => job.status == JobStatus::Pending,
            _ => false,
        }
    }

    fn build_command(&self, job: &Job) -> Result<Vec<String>, HandlerError> {
        let mut cmd = command_prefix(self.name(), &self.command)?;

        let model = config_arg(self.name(), job, NARRATIVE_STAGE, "model")?
            .unwrap_or_else(|| self.default_model.clone());
        let max_batch_size = config_arg(self.name(), job, NARRATIVE_STAGE, "max_batch_size")?
            .unwrap_or_else(|| self.default_max_batch_size.to_string());
        let no_cache = job
            .config_value(NARRATIVE_STAGE, "no_cache")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        cmd.push(format!("--conversation_id={}", job.conversation_id));
        cmd.push(format!("--model={model}"));
        cmd.push(format!("--max-batch-size={max_batch_size}"));
        if no_cache {
            cmd.push("--no-cache".to_string());
        }
        Ok(cmd)
    }
}
