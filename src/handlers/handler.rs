//! Handler trait and the shared run-and-reconcile sequence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::{Error, HandlerError, JobError};
use crate::executor::SubprocessExecutor;
use crate::jobs::{Job, LogLevel};
use crate::safety::validate_environment_variables;
use crate::store::JobStore;

/// Variables always set by the worker; `job.environment` cannot override them.
pub const RESERVED_ENV_NAMES: &[&str] = &["DELPHI_JOB_ID", "DELPHI_REPORT_ID"];

/// What a handler needs to run a job.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<JobStore>,
    pub executor: Arc<SubprocessExecutor>,
}

/// Turns a job into a command line. Everything else is shared.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this handler should process `job`.
    fn can_handle(&self, job: &Job) -> bool;

    /// argv for the external process.
    fn build_command(&self, job: &Job) -> Result<Vec<String>, HandlerError>;

    /// Run the job to a recorded outcome. Returns whether it succeeded.
    ///
    /// Never fails: any error is logged and the job is forced to FAILED.
    async fn process(&self, ctx: &HandlerContext, mut job: Job) -> bool {
        match run_job(self, ctx, &mut job).await {
            Ok(success) => success,
            Err(e) => {
                error!(job_id = %job.job_id, handler = self.name(), error = %e, "Error processing job");
                force_failed(ctx, &mut job, &e.to_string()).await;
                false
            }
        }
    }
}

async fn run_job<H: Handler + ?Sized>(
    handler: &H,
    ctx: &HandlerContext,
    job: &mut Job,
) -> Result<bool, Error> {
    let starting_status = job.status;
    info!(job_id = %job.job_id, handler = handler.name(), job_type = %job.job_type, "Processing job");
    append_log(
        ctx,
        job,
        LogLevel::Info,
        format!("Starting {} job {}", job.job_type, job.job_id),
    )
    .await;

    let cmd = handler.build_command(job)?;
    append_log(
        ctx,
        job,
        LogLevel::Info,
        format!("Running command: {}", cmd.join(" ")),
    )
    .await;

    let env = prepare_environment(job);
    let outcome = ctx
        .executor
        .execute(&cmd, &env, job.timeout_seconds, job)
        .await;

    let live = ctx
        .store
        .get_job(&job.job_id)
        .await?
        .ok_or_else(|| JobError::NotFound {
            id: job.job_id.clone(),
        })?;

    if live.status != starting_status {
        info!(
            job_id = %job.job_id,
            from = %starting_status,
            to = %live.status,
            "Process changed job status directly, preserving it"
        );
        ctx.store
            .preserve_job_status(job, outcome.result)
            .await?;
    } else {
        job.version = live.version;
        let error = outcome
            .result
            .get("error")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        ctx.store
            .complete_job(job, outcome.success, Some(outcome.result), error.as_deref())
            .await?;
    }

    Ok(outcome.success)
}

/// Log the failure and write FAILED against the live version.
///
/// A job that is already COMPLETED or FAILED keeps its status; the error is
/// merged into its `job_results` instead.
async fn force_failed(ctx: &HandlerContext, job: &mut Job, message: &str) {
    append_log(
        ctx,
        job,
        LogLevel::Error,
        format!("Error processing job: {message}"),
    )
    .await;

    let live = match ctx.store.get_job(&job.job_id).await {
        Ok(live) => live,
        Err(e) => {
            warn!(job_id = %job.job_id, error = %e, "Could not refresh job before failing it");
            None
        }
    };

    if let Some(live) = live {
        if live.status.is_terminal() {
            let mut results = match live.job_results {
                Some(serde_json::Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            results.insert("error".into(), serde_json::Value::String(message.to_string()));
            if let Err(e) = ctx
                .store
                .preserve_job_status(job, serde_json::Value::Object(results))
                .await
            {
                error!(job_id = %job.job_id, error = %e, "Could not record error on finished job");
            }
            return;
        }
        job.version = live.version;
    }

    if let Err(e) = ctx.store.complete_job(job, false, None, Some(message)).await {
        error!(job_id = %job.job_id, error = %e, "Could not mark job as failed");
    }
}

async fn append_log(ctx: &HandlerContext, job: &mut Job, level: LogLevel, message: String) {
    if let Err(e) = ctx.store.update_job_logs(job, level, message).await {
        warn!(job_id = %job.job_id, error = %e, "Failed to update job logs");
    }
}

/// The environment for a job's process: the worker's own environment,
/// validated `job.environment` entries, then the reserved job variables.
pub fn prepare_environment(job: &Job) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    for (key, value) in validate_environment_variables(&job.environment) {
        if RESERVED_ENV_NAMES.contains(&key.as_str()) {
            warn!(job_id = %job.job_id, key = %key, "Ignoring attempt to override reserved variable");
            continue;
        }
        env.insert(key, value);
    }

    env.insert("DELPHI_JOB_ID".to_string(), job.job_id.clone());
    env.insert(
        "DELPHI_REPORT_ID".to_string(),
        job.report_id_or_conversation().to_string(),
    );
    env
}

/// Render a scalar config value as a command-line argument.
pub(crate) fn arg_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `key` from the stage config (or top-level `job_config`) as an argument.
/// A present value that is not a scalar is a config error.
pub(crate) fn config_arg(
    handler: &'static str,
    job: &Job,
    stage: &str,
    key: &str,
) -> Result<Option<String>, HandlerError> {
    match job.config_value(stage, key) {
        None => Ok(None),
        Some(value) => arg_value(value).map(Some).ok_or_else(|| HandlerError::InvalidConfig {
            handler: handler.to_string(),
            reason: format!("{key} must be a string, number or boolean"),
        }),
    }
}

/// Copy a configured argv prefix, rejecting an empty one.
pub(crate) fn command_prefix(
    handler: &'static str,
    prefix: &[String],
) -> Result<Vec<String>, HandlerError> {
    if prefix.is_empty() {
        return Err(HandlerError::EmptyCommand {
            handler: handler.to_string(),
        });
    }
    Ok(prefix.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobType, NewJob};

    fn job() -> Job {
        let mut new = NewJob::new("conv-7", JobType::FullPipeline);
        new.job_id = Some("j-env".into());
        new.environment.insert("DELPHI_MODE".into(), "fast".into());
        new.environment.insert("DELPHI_JOB_ID".into(), "spoofed".into());
        new.environment.insert("EVIL_VAR".into(), "x".into());
        new.into_job(60)
    }

    #[test]
    fn environment_injects_job_variables() {
        let env = prepare_environment(&job());
        assert_eq!(env.get("DELPHI_JOB_ID").map(String::as_str), Some("j-env"));
        assert_eq!(env.get("DELPHI_REPORT_ID").map(String::as_str), Some("conv-7"));
        assert_eq!(env.get("DELPHI_MODE").map(String::as_str), Some("fast"));
        assert!(!env.contains_key("EVIL_VAR"));
    }

    #[test]
    fn report_id_wins_over_conversation() {
        let mut job = job();
        job.report_id = Some("report-1".into());
        let env = prepare_environment(&job);
        assert_eq!(env.get("DELPHI_REPORT_ID").map(String::as_str), Some("report-1"));
    }

    #[test]
    fn non_scalar_config_is_rejected() {
        let mut job = job();
        job.job_config = serde_json::json!({"max_votes": {"nested": 1}});
        assert!(matches!(
            config_arg("pipeline", &job, "PCA", "max_votes"),
            Err(HandlerError::InvalidConfig { .. })
        ));
        assert_eq!(config_arg("pipeline", &job, "PCA", "missing").unwrap(), None);
    }

    async fn context() -> HandlerContext {
        let db = crate::store::LibSqlBackend::new_memory().await.unwrap();
        let store = Arc::new(JobStore::new(
            Arc::new(db),
            crate::config::RetryPolicy::default(),
        ));
        let executor = Arc::new(SubprocessExecutor::new(
            crate::config::ExecutorConfig::default(),
            Arc::clone(&store),
        ));
        HandlerContext { store, executor }
    }

    #[tokio::test]
    async fn forced_failure_keeps_status_set_by_process() {
        let ctx = context().await;
        let submitted = ctx.store.submit_job(NewJob::new("conv", JobType::FullPipeline)).await.unwrap();
        let mut job = ctx.store.claim_job(&submitted, "w", false).await.unwrap();

        ctx.store
            .database()
            .conditional_update(
                &job.job_id,
                &crate::store::JobUpdate {
                    status: Some(crate::jobs::JobStatus::Completed),
                    job_results: Some(serde_json::json!({"return_code": 0})),
                    ..Default::default()
                },
                crate::store::UpdateCondition::version(job.version),
            )
            .await
            .unwrap();

        force_failed(&ctx, &mut job, "lost the reconciliation race").await;

        let stored = ctx.store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::jobs::JobStatus::Completed);
        let results = stored.job_results.unwrap();
        assert_eq!(results["return_code"], 0);
        assert_eq!(results["error"], "lost the reconciliation race");
        assert!(stored.logs.iter().any(|l| l.message.starts_with("Error processing job")));
    }

    #[tokio::test]
    async fn forced_failure_fails_running_job() {
        let ctx = context().await;
        let submitted = ctx.store.submit_job(NewJob::new("conv", JobType::FullPipeline)).await.unwrap();
        let mut job = ctx.store.claim_job(&submitted, "w", false).await.unwrap();

        force_failed(&ctx, &mut job, "bad config").await;

        let stored = ctx.store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::jobs::JobStatus::Failed);
        assert_eq!(stored.job_results.unwrap()["error"], "bad config");
    }

    #[test]
    fn arg_values() {
        assert_eq!(arg_value(&serde_json::json!(5)), Some("5".into()));
        assert_eq!(arg_value(&serde_json::json!("x")), Some("x".into()));
        assert_eq!(arg_value(&serde_json::json!([1])), None);
    }
}
