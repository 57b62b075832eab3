//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

/// Retry budget for transient store errors.
///
/// Attempt `n` (zero-based) sleeps `base_delay * 2^n` before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Command lines and defaults used by the built-in handlers.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// argv prefix for the full math/clustering pipeline.
    pub pipeline_command: Vec<String>,
    /// argv prefix for the narrative batch submission script.
    pub narrative_batch_command: Vec<String>,
    /// argv prefix for the batch status checker.
    pub batch_status_command: Vec<String>,
    /// Model passed as `--model` when the job does not name one.
    pub default_model: String,
    /// `--max-batch-size` when the job does not set one.
    pub default_max_batch_size: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            pipeline_command: split_command("python run_delphi.py"),
            narrative_batch_command: split_command(
                "python umap_narrative/801_narrative_report_batch.py",
            ),
            batch_status_command: split_command("python umap_narrative/803_check_batch_status.py"),
            default_model: "claude-3-7-sonnet-20250219".to_string(),
            default_max_batch_size: 20,
        }
    }
}

/// Subprocess executor limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Lines kept per stream; oldest lines are dropped first.
    pub max_output_lines: usize,
    /// Time between the terminate signal and the forced kill.
    pub kill_grace_period: Duration,
    /// Prefix for the `visualization_urls` written into job results.
    pub visualization_base_url: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_lines: 1000,
            kill_grace_period: Duration::from_secs(5),
            visualization_base_url: "/visualizations".to_string(),
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Identity recorded on every claim.
    pub worker_id: String,
    /// Sleep between polls when no work is found.
    pub poll_interval: Duration,
    /// Batch-status jobs fetched per poll.
    pub batch_check_limit: usize,
    /// Timeout assigned to jobs submitted without one.
    pub default_timeout_seconds: u64,
    /// Optional directory for a rolling log file.
    pub log_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub executor: ExecutorConfig,
    pub handlers: HandlerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/delphi-jobs.db"),
            worker_id: Uuid::new_v4().to_string(),
            poll_interval: Duration::from_secs(10),
            batch_check_limit: 3,
            default_timeout_seconds: 3600,
            log_dir: None,
            retry: RetryPolicy::default(),
            executor: ExecutorConfig::default(),
            handlers: HandlerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Build config from `DELPHI_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("DELPHI_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let worker_id = std::env::var("DELPHI_WORKER_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.worker_id);

        let poll_interval = Duration::from_secs(env_parse(
            "DELPHI_POLL_INTERVAL_SECS",
            defaults.poll_interval.as_secs(),
        )?);

        let retry = RetryPolicy {
            max_retries: env_parse("DELPHI_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: Duration::from_millis(env_parse(
                "DELPHI_RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
        };

        let executor = ExecutorConfig {
            max_output_lines: env_parse(
                "DELPHI_MAX_OUTPUT_LINES",
                defaults.executor.max_output_lines,
            )?,
            kill_grace_period: Duration::from_secs(env_parse(
                "DELPHI_KILL_GRACE_SECS",
                defaults.executor.kill_grace_period.as_secs(),
            )?),
            visualization_base_url: std::env::var("DELPHI_VISUALIZATION_BASE_URL")
                .unwrap_or(defaults.executor.visualization_base_url),
        };

        let handlers = HandlerConfig {
            pipeline_command: env_command(
                "DELPHI_PIPELINE_COMMAND",
                defaults.handlers.pipeline_command,
            )?,
            narrative_batch_command: env_command(
                "DELPHI_NARRATIVE_BATCH_COMMAND",
                defaults.handlers.narrative_batch_command,
            )?,
            batch_status_command: env_command(
                "DELPHI_BATCH_STATUS_COMMAND",
                defaults.handlers.batch_status_command,
            )?,
            default_model: std::env::var("DELPHI_NARRATIVE_MODEL")
                .unwrap_or(defaults.handlers.default_model),
            default_max_batch_size: env_parse(
                "DELPHI_NARRATIVE_MAX_BATCH_SIZE",
                defaults.handlers.default_max_batch_size,
            )?,
        };

        Ok(Self {
            db_path,
            worker_id,
            poll_interval,
            batch_check_limit: env_parse("DELPHI_BATCH_CHECK_LIMIT", defaults.batch_check_limit)?,
            default_timeout_seconds: env_parse(
                "DELPHI_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout_seconds,
            )?,
            log_dir: std::env::var("DELPHI_LOG_DIR").ok().map(PathBuf::from),
            retry,
            executor,
            handlers,
        })
    }
}

/// Parse an optional numeric variable; a present-but-malformed value is an error.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_command(key: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            let argv = split_command(&raw);
            if argv.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "command must not be empty".to_string(),
                });
            }
            Ok(argv)
        }
        Err(_) => Ok(default),
    }
}

/// Split a whitespace-separated command into argv.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn default_batch_check_limit_is_three() {
        assert_eq!(WorkerConfig::default().batch_check_limit, 3);
    }

    #[test]
    fn split_command_ignores_extra_whitespace() {
        assert_eq!(
            split_command("  python   run.py --x "),
            vec!["python", "run.py", "--x"]
        );
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // Unlikely to collide with a real variable.
        let key = "DELPHI_TEST_ENV_PARSE_GARBAGE_7F3A";
        unsafe { std::env::set_var(key, "not-a-number") };
        let result: Result<u64, _> = env_parse(key, 5);
        unsafe { std::env::remove_var(key) };
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
