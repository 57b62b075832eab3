//! End-to-end worker tests.
//!
//! Each test opens a file-backed libSQL store in a temp dir, submits jobs,
//! and drives a real `Worker` whose handlers shell out to `sh`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use delphi_orchestrator::config::{ExecutorConfig, HandlerConfig, RetryPolicy, WorkerConfig};
use delphi_orchestrator::handlers::HandlerRegistry;
use delphi_orchestrator::jobs::{ChildJobRequest, JobStatus, JobTree, JobType, LogLevel, NewJob};
use delphi_orchestrator::store::{JobStore, JobUpdate, LibSqlBackend, UpdateCondition};
use delphi_orchestrator::worker::Worker;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

struct Harness {
    _dir: TempDir,
    db_path: PathBuf,
    store: Arc<JobStore>,
    config: WorkerConfig,
}

impl Harness {
    async fn new(pipeline_script: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("jobs.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        let retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
        };
        let store = Arc::new(JobStore::new(Arc::new(db), retry));

        let config = WorkerConfig {
            worker_id: "it-worker".into(),
            poll_interval: Duration::from_millis(20),
            retry,
            executor: ExecutorConfig {
                kill_grace_period: Duration::from_millis(200),
                ..Default::default()
            },
            handlers: HandlerConfig {
                pipeline_command: vec!["sh".into(), "-c".into(), pipeline_script.into()],
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            _dir: dir,
            db_path,
            store,
            config,
        }
    }

    fn worker(&self) -> Worker {
        let registry = Arc::new(HandlerRegistry::with_defaults(&self.config.handlers));
        Worker::new(&self.config, Arc::clone(&self.store), registry)
    }

    /// Write to the jobs table the way an external script would.
    async fn raw_sql(&self, sql: &str) {
        let db = libsql::Builder::new_local(&self.db_path)
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        conn.execute(sql, ()).await.unwrap();
    }

    async fn submit(&self, id: &str) -> delphi_orchestrator::jobs::Job {
        let mut new = NewJob::new("conv-42", JobType::FullPipeline);
        new.job_id = Some(id.to_string());
        self.store.submit_job(new).await.unwrap()
    }
}

#[tokio::test]
async fn pipeline_job_runs_to_completion() {
    let h = Harness::new(r#"echo "start $0"; echo "job $DELPHI_JOB_ID COMPLETED""#).await;
    h.submit("j1").await;

    let dispatched = timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();
    assert!(dispatched);

    let job = h.store.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.worker_id.as_deref(), Some("it-worker"));
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    let results = job.job_results.unwrap();
    assert_eq!(results["result_type"], "SUCCESS");
    assert_eq!(results["return_code"], 0);
    assert_eq!(
        results["output_summary"],
        "start --zid=conv-42\njob j1 COMPLETED"
    );
    assert_eq!(results["visualization_path"], "visualizations/conv-42/j1");

    let messages: Vec<&str> = job.logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages[0], "Starting FULL_PIPELINE job j1");
    assert!(messages[1].starts_with("Running command: sh -c"));
    assert!(
        job.logs
            .iter()
            .any(|l| l.level == LogLevel::Info && l.message == "job j1 COMPLETED")
    );
}

#[tokio::test]
async fn failing_process_marks_job_failed() {
    let h = Harness::new("echo 'disk full' >&2; exit 2").await;
    h.submit("bad").await;

    timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();

    let job = h.store.get_job("bad").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let results = job.job_results.unwrap();
    assert_eq!(results["result_type"], "FAILURE");
    assert_eq!(results["return_code"], 2);
    assert_eq!(results["error"], "disk full");
}

#[tokio::test]
async fn long_running_process_times_out() {
    let h = Harness::new("echo working; exec sleep 30").await;
    let mut new = NewJob::new("conv-42", JobType::FullPipeline);
    new.job_id = Some("slow".into());
    new.timeout_seconds = Some(1);
    h.store.submit_job(new).await.unwrap();

    timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();

    let job = h.store.get_job("slow").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let results = job.job_results.unwrap();
    assert_eq!(results["return_code"], -1);
    assert!(!results["error"].as_str().unwrap().is_empty());
    assert!(
        job.logs
            .iter()
            .any(|l| l.level == LogLevel::Error && l.message.contains("timed out"))
    );
}

#[tokio::test]
async fn reserved_environment_cannot_be_overridden() {
    let h = Harness::new(r#"echo "$DELPHI_JOB_ID $DELPHI_EXTRA""#).await;
    let mut new = NewJob::new("conv-42", JobType::FullPipeline);
    new.job_id = Some("env-job".into());
    new.environment.insert("DELPHI_JOB_ID".into(), "spoofed".into());
    new.environment.insert("DELPHI_EXTRA".into(), "x".into());
    h.store.submit_job(new).await.unwrap();

    timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();

    let job = h.store.get_job("env-job").await.unwrap().unwrap();
    assert_eq!(job.job_results.unwrap()["output_summary"], "env-job x");
}

#[tokio::test]
async fn status_written_by_process_is_preserved() {
    let h = Harness::new("sleep 1").await;
    h.submit("ext").await;

    // Stand-in for a script that writes its own terminal status.
    let store = Arc::clone(&h.store);
    let external = tokio::spawn(async move {
        loop {
            let job = store.get_job("ext").await.unwrap().unwrap();
            if job
                .logs
                .iter()
                .any(|l| l.message.starts_with("Running command"))
            {
                store
                    .database()
                    .conditional_update(
                        "ext",
                        &JobUpdate {
                            status: Some(JobStatus::Completed),
                            ..Default::default()
                        },
                        UpdateCondition::version(job.version),
                    )
                    .await
                    .unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();
    external.await.unwrap();

    let job = h.store.get_job("ext").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let results = job.job_results.unwrap();
    assert_eq!(results["return_code"], 0);
    assert!(results.get("result_type").is_none());
}

#[tokio::test]
async fn racing_workers_claim_once() {
    let h = Harness::new("true").await;
    h.submit("only").await;

    let (a, b) = (h.worker(), h.worker());
    let (ra, rb) = timeout(TEST_TIMEOUT, async { tokio::join!(a.run_once(), b.run_once()) })
        .await
        .unwrap();
    assert_eq!(ra.unwrap() as u8 + rb.unwrap() as u8, 1);

    let job = h.store.get_job("only").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn tree_repair_over_file_store() {
    let h = Harness::new("true").await;
    h.submit("root").await;
    let tree = JobTree::new(Arc::clone(&h.store));

    let listed = tree
        .create_child_job("root", ChildJobRequest::default())
        .await
        .unwrap();
    let mut stray = NewJob::new("conv-42", JobType::FullPipeline);
    stray.job_id = Some("stray".into());
    stray.parent_job_id = Some("root".into());
    h.store.submit_job(stray).await.unwrap();

    let dry = tree.repair_job_tree("stray", false).await.unwrap();
    assert_eq!(dry.validation.warnings.len(), 1);
    assert!(dry.fixed.is_empty());

    let fixed = tree.repair_job_tree("stray", true).await.unwrap();
    assert_eq!(fixed.fixed.len(), 1);

    let root = h.store.get_job("root").await.unwrap().unwrap();
    assert_eq!(root.child_jobs, vec![listed.job_id, "stray".to_string()]);
}

#[tokio::test]
async fn corrupt_pending_row_does_not_block_queue() {
    let h = Harness::new("true").await;
    h.submit("broken").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.submit("healthy").await;
    h.raw_sql("UPDATE jobs SET job_config = '{oops' WHERE job_id = 'broken'")
        .await;

    let dispatched = timeout(TEST_TIMEOUT, h.worker().run_once())
        .await
        .unwrap()
        .unwrap();
    assert!(dispatched);

    let job = h.store.get_job("healthy").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(h.store.get_job("broken").await.is_err());
}
