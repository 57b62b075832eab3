use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use delphi_orchestrator::config::WorkerConfig;
use delphi_orchestrator::handlers::HandlerRegistry;
use delphi_orchestrator::jobs::{ChildJobRequest, Job, JobStatus, JobTree, JobType, NewJob};
use delphi_orchestrator::store::{JobStore, LibSqlBackend};
use delphi_orchestrator::worker::Worker;

#[derive(Parser)]
#[command(name = "delphi-jobs", version, about = "Delphi job orchestration")]
struct Cli {
    /// libSQL database file (overrides DELPHI_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poll loop until Ctrl-C
    Worker,

    /// Submit a new job
    Submit {
        #[arg(long)]
        conversation_id: String,
        #[arg(long, default_value = "FULL_PIPELINE")]
        job_type: String,
        #[arg(long)]
        report_id: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// job_config as a JSON document
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
        /// Job that created the batch this job awaits
        #[arg(long)]
        batch_job_id: Option<String>,
        /// Extra environment for the job's process, KEY=VALUE
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },

    /// List recent jobs
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one job
    Details { job_id: String },

    /// Create a child job under an existing job
    CreateChild {
        parent_job_id: String,
        #[arg(long, default_value = "FULL_PIPELINE")]
        job_type: String,
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the tree containing a job
    Tree { job_id: String },

    /// Check a job tree for lineage problems
    Validate { job_id: String },

    /// Repair a job tree (dry run unless --fix)
    Repair {
        job_id: String,
        #[arg(long)]
        fix: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WorkerConfig::from_env().context("invalid DELPHI_* configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());

    let store = Arc::new(open_store(&config).await?);

    match cli.command {
        Command::Worker => run_worker(&config, store).await,
        Command::Submit {
            conversation_id,
            job_type,
            report_id,
            priority,
            config: job_config,
            timeout,
            batch_job_id,
            env,
        } => {
            let new_job = NewJob {
                conversation_id,
                job_type: JobType::parse(&job_type),
                report_id,
                priority,
                job_config: parse_config(job_config.as_deref())?,
                timeout_seconds: timeout,
                batch_job_id,
                environment: env.into_iter().collect::<BTreeMap<_, _>>(),
                ..Default::default()
            };
            let job = store.submit_job(new_job).await?;
            print_json(&job)
        }
        Command::List {
            status,
            conversation_id,
            limit,
        } => {
            let jobs = match conversation_id {
                Some(conversation_id) => {
                    store
                        .jobs_for_conversation(&conversation_id, limit)
                        .await?
                }
                None => {
                    let status = status
                        .as_deref()
                        .map(str::parse::<JobStatus>)
                        .transpose()?;
                    store.list_jobs(status, limit).await?
                }
            };
            let rows: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
            print_json(&rows)
        }
        Command::Details { job_id } => {
            let job = store
                .get_job(&job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            print_json(&job)
        }
        Command::CreateChild {
            parent_job_id,
            job_type,
            stage,
            config: job_config,
            priority,
            timeout,
        } => {
            let tree = JobTree::new(store);
            let child = tree
                .create_child_job(
                    &parent_job_id,
                    ChildJobRequest {
                        job_type: JobType::parse(&job_type),
                        job_stage: stage,
                        job_config: parse_config(job_config.as_deref())?,
                        priority,
                        timeout_seconds: timeout,
                        ..Default::default()
                    },
                )
                .await?;
            print_json(&child)
        }
        Command::Tree { job_id } => {
            let view = JobTree::new(store).get_job_tree(&job_id).await?;
            let rows: Vec<JobSummary> = view.jobs.iter().map(JobSummary::from).collect();
            print_json(&serde_json::json!({
                "root_job_id": view.root_job_id,
                "jobs": rows,
            }))
        }
        Command::Validate { job_id } => {
            let report = JobTree::new(store).validate_job_tree(&job_id).await?;
            print_json(&report)
        }
        Command::Repair { job_id, fix } => {
            let report = JobTree::new(store).repair_job_tree(&job_id, fix).await?;
            print_json(&report)
        }
    }
}

/// Console logging to stderr, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "delphi-jobs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    guard
}

async fn open_store(config: &WorkerConfig) -> anyhow::Result<JobStore> {
    let db = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    Ok(JobStore::new(Arc::new(db), config.retry)
        .with_default_timeout(config.default_timeout_seconds))
}

async fn run_worker(config: &WorkerConfig, store: Arc<JobStore>) -> anyhow::Result<()> {
    eprintln!("Delphi job worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker_id);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Poll interval: {}s", config.poll_interval.as_secs());

    let registry = Arc::new(HandlerRegistry::with_defaults(&config.handlers));
    let worker = Arc::new(Worker::new(config, store, registry));

    let stopper = Arc::clone(&worker);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, finishing current iteration");
            stopper.stop();
        }
    });

    worker.run().await;
    Ok(())
}

/// Compact row for listings.
#[derive(Serialize)]
struct JobSummary<'a> {
    job_id: &'a str,
    job_type: String,
    status: JobStatus,
    conversation_id: &'a str,
    parent_job_id: Option<&'a str>,
    version: i64,
    created_at: String,
    worker_id: Option<&'a str>,
}

impl<'a> From<&'a Job> for JobSummary<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_id: &job.job_id,
            job_type: job.job_type.to_string(),
            status: job.status,
            conversation_id: &job.conversation_id,
            parent_job_id: job.parent_job_id.as_deref(),
            version: job.version,
            created_at: job.created_at.to_rfc3339(),
            worker_id: job.worker_id.as_deref(),
        }
    }
}

fn parse_config(raw: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).context("--config must be a JSON document"))
        .transpose()
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
