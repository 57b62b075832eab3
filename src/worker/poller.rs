//! Worker poll loop.
//!
//! One job in flight per worker. Each iteration prefers a batch-status job
//! over a fresh PENDING job, claims it through the version check, and blocks
//! on its handler until the outcome is recorded. Scale out by running more
//! workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{DatabaseError, HandlerError};
use crate::executor::SubprocessExecutor;
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::jobs::{Job, LogLevel};
use crate::store::JobStore;

/// Polls the job store and dispatches claimed jobs to handlers.
pub struct Worker {
    worker_id: String,
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    ctx: HandlerContext,
    poll_interval: Duration,
    batch_check_limit: usize,
    running: AtomicBool,
    stop_requested: AtomicBool,
    wake: Notify,
}

impl Worker {
    pub fn new(config: &WorkerConfig, store: Arc<JobStore>, registry: Arc<HandlerRegistry>) -> Self {
        let executor = Arc::new(SubprocessExecutor::new(
            config.executor.clone(),
            Arc::clone(&store),
        ));
        Self {
            worker_id: config.worker_id.clone(),
            ctx: HandlerContext {
                store: Arc::clone(&store),
                executor,
            },
            store,
            registry,
            poll_interval: config.poll_interval,
            batch_check_limit: config.batch_check_limit,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask [`Worker::run`] to return after the current iteration. A stop
    /// requested before `run` starts makes it return immediately.
    pub fn stop(&self) {
        info!(worker_id = %self.worker_id, "Worker stop requested");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Poll until [`Worker::stop`] is called.
    ///
    /// A dispatched job is followed immediately by the next poll; an idle or
    /// failed iteration sleeps for the poll interval.
    pub async fn run(&self) {
        if self.stop_requested.load(Ordering::SeqCst) {
            info!(worker_id = %self.worker_id, "Worker stopped before it started");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        info!(
            worker_id = %self.worker_id,
            poll_interval_secs = self.poll_interval.as_secs(),
            handlers = ?self.registry.names(),
            "Worker started"
        );

        while !self.stop_requested.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => debug!(worker_id = %self.worker_id, "No jobs available"),
                Err(e) => error!(worker_id = %self.worker_id, error = %e, "Worker poll failed"),
            }
            self.idle().await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    /// One poll iteration. Returns whether a job was claimed and processed.
    pub async fn run_once(&self) -> Result<bool, DatabaseError> {
        let batch_jobs = self.store.find_batch_status_jobs(self.batch_check_limit).await?;
        if let Some(job) = batch_jobs.into_iter().next() {
            debug!(job_id = %job.job_id, "Found batch status job");
            if let Some(claimed) = self.store.claim_job(&job, &self.worker_id, true).await {
                self.dispatch(&job, claimed).await;
                return Ok(true);
            }
        }

        if let Some(job) = self.store.find_pending_job().await? {
            debug!(job_id = %job.job_id, "Found pending job");
            if let Some(claimed) = self.store.claim_job(&job, &self.worker_id, false).await {
                self.dispatch(&job, claimed).await;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Route a claimed job. The handler is chosen from the pre-claim snapshot
    /// so status-dependent legacy tags resolve as submitted.
    async fn dispatch(&self, snapshot: &Job, mut claimed: Job) {
        let Some(handler) = self.registry.find(snapshot) else {
            let e = HandlerError::NoHandler {
                job_type: snapshot.job_type.to_string(),
            };
            warn!(job_id = %claimed.job_id, error = %e, "No handler for job");
            if let Err(log_err) = self
                .store
                .update_job_logs(&mut claimed, LogLevel::Error, e.to_string())
                .await
            {
                debug!(job_id = %claimed.job_id, error = %log_err, "Could not log missing handler");
            }
            if let Err(write_err) = self
                .store
                .complete_job(&mut claimed, false, None, Some(&e.to_string()))
                .await
            {
                error!(job_id = %claimed.job_id, error = %write_err, "Could not fail unhandled job");
            }
            return;
        };

        let job_id = claimed.job_id.clone();
        let success = handler.process(&self.ctx, claimed).await;
        info!(job_id = %job_id, handler = handler.name(), success, "Job processed");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerConfig, RetryPolicy};
    use crate::jobs::{JobStatus, JobType, NewJob};
    use crate::store::LibSqlBackend;

    async fn setup(registry: HandlerRegistry) -> (Arc<Worker>, Arc<JobStore>) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let store = Arc::new(JobStore::new(Arc::new(db), RetryPolicy::default()));
        let config = WorkerConfig {
            worker_id: "worker-test".into(),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let worker = Arc::new(Worker::new(&config, Arc::clone(&store), Arc::new(registry)));
        (worker, store)
    }

    fn true_handlers() -> HandlerRegistry {
        let config = HandlerConfig {
            pipeline_command: vec!["true".into()],
            narrative_batch_command: vec!["true".into()],
            batch_status_command: vec!["true".into()],
            ..Default::default()
        };
        HandlerRegistry::with_defaults(&config)
    }

    async fn submit(store: &JobStore, id: &str, job_type: JobType) -> Job {
        let mut new = NewJob::new("conv", job_type);
        new.job_id = Some(id.to_string());
        store.submit_job(new).await.unwrap()
    }

    #[tokio::test]
    async fn idle_store_dispatches_nothing() {
        let (worker, _) = setup(true_handlers()).await;
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn batch_status_job_goes_first() {
        let (worker, store) = setup(true_handlers()).await;
        submit(&store, "plain", JobType::FullPipeline).await;
        let waiting = submit(&store, "waiting", JobType::AwaitingNarrativeBatch).await;
        store.claim_job(&waiting, "submitter", false).await.unwrap();

        assert!(worker.run_once().await.unwrap());
        let waiting = store.get_job("waiting").await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Completed);
        assert_eq!(waiting.worker_id.as_deref(), Some("worker-test"));
        assert!(waiting.batch_check_time.is_some());
        let plain = store.get_job("plain").await.unwrap().unwrap();
        assert_eq!(plain.status, JobStatus::Pending);

        assert!(worker.run_once().await.unwrap());
        let plain = store.get_job("plain").await.unwrap().unwrap();
        assert_eq!(plain.status, JobStatus::Completed);

        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn unhandled_job_is_failed() {
        let (worker, store) = setup(HandlerRegistry::new()).await;
        submit(&store, "orphan", JobType::FullPipeline).await;

        assert!(worker.run_once().await.unwrap());
        let job = store.get_job("orphan").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.job_results.unwrap()["error"],
            "No handler found for job type FULL_PIPELINE"
        );
    }

    #[tokio::test]
    async fn handler_error_forces_failed() {
        let (worker, store) = setup(true_handlers()).await;
        let mut new = NewJob::new("conv", JobType::FullPipeline);
        new.job_id = Some("bad-config".into());
        new.job_config = Some(serde_json::json!({"max_votes": [1, 2]}));
        store.submit_job(new).await.unwrap();

        assert!(worker.run_once().await.unwrap());
        let job = store.get_job("bad-config").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.job_results.unwrap()["error"].as_str().unwrap().to_string();
        assert!(error.contains("max_votes"), "{error}");
        assert!(
            job.logs
                .iter()
                .any(|l| l.level == LogLevel::Error && l.message.starts_with("Error processing job"))
        );
    }

    #[tokio::test]
    async fn legacy_pending_tag_runs_narrative_handler() {
        let (worker, store) = setup(true_handlers()).await;
        submit(&store, "legacy", JobType::NarrativeBatch).await;

        assert!(worker.run_once().await.unwrap());
        let job = store.get_job("legacy").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(
            job.logs
                .iter()
                .any(|l| l.message.starts_with("Running command: true --conversation_id=conv"))
        );
    }

    #[tokio::test]
    async fn stop_ends_run_loop() {
        let (worker, _) = setup(true_handlers()).await;
        let runner = Arc::clone(&worker);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.is_running());
        worker.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn stop_before_run_is_honoured() {
        let (worker, store) = setup(true_handlers()).await;
        submit(&store, "untouched", JobType::FullPipeline).await;

        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("run ignored an earlier stop");

        assert!(!worker.is_running());
        let job = store.get_job("untouched").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
