//! Full math/clustering pipeline.

use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::handlers::handler::{Handler, command_prefix, config_arg};
use crate::jobs::{Job, JobType};

/// Stage whose config carries the pipeline's tuning flags.
const PCA_STAGE: &str = "PCA";

/// Runs `FULL_PIPELINE` jobs.
pub struct PipelineJobHandler {
    command: Vec<String>,
}

impl PipelineJobHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            command: config.pipeline_command.clone(),
        }
    }
}

impl Handler for PipelineJobHandler {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn can_handle(&self, job: &Job) -> bool {
        job.job_type == JobType::FullPipeline
    }

    fn build_command(&self, job: &Job) -> Result<Vec<String>, HandlerError> {
        let mut cmd = command_prefix(self.name(), &self.command)?;
        cmd.push(format!("--zid={}", job.conversation_id));

        for (key, flag) in [("max_votes", "--max-votes"), ("batch_size", "--batch-size")] {
            if let Some(value) = config_arg(self.name(), job, PCA_STAGE, key)? {
                cmd.push(format!("{flag}={value}"));
            }
        }
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::NewJob;

    fn handler() -> PipelineJobHandler {
        PipelineJobHandler::new(&HandlerConfig::default())
    }

    fn job(config: serde_json::Value) -> Job {
        let mut new = NewJob::new("12345", JobType::FullPipeline);
        new.job_config = Some(config);
        new.into_job(60)
    }

    #[test]
    fn minimal_command() {
        let cmd = handler().build_command(&job(json!({}))).unwrap();
        assert_eq!(cmd, vec!["python", "run_delphi.py", "--zid=12345"]);
    }

    #[test]
    fn flags_from_pca_stage() {
        let config = json!({
            "stages": [
                {"stage": "UMAP", "config": {"batch_size": 1}},
                {"stage": "PCA", "config": {"max_votes": 5000, "batch_size": 200}}
            ]
        });
        let cmd = handler().build_command(&job(config)).unwrap();
        assert_eq!(
            &cmd[2..],
            &["--zid=12345", "--max-votes=5000", "--batch-size=200"]
        );
    }

    #[test]
    fn flags_from_top_level() {
        let cmd = handler()
            .build_command(&job(json!({"max_votes": "100"})))
            .unwrap();
        assert_eq!(cmd.last().map(String::as_str), Some("--max-votes=100"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let handler = PipelineJobHandler { command: vec![] };
        assert!(matches!(
            handler.build_command(&job(json!({}))),
            Err(HandlerError::EmptyCommand { .. })
        ));
    }

    #[test]
    fn matches_only_pipeline_jobs() {
        let h = handler();
        assert!(h.can_handle(&job(json!({}))));
        let mut other = job(json!({}));
        other.job_type = JobType::CreateNarrativeBatch;
        assert!(!h.can_handle(&other));
    }
}
