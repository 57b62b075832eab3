//! Error types for the job orchestrator.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Job tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// How the retry policy should treat a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A conditional write lost the race. Expected; never retried.
    Contention,
    /// Lock or throughput failure in the backend. Retried with backoff.
    Transient,
    /// Anything else.
    Other,
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conditional update failed for job {job_id}")]
    ConditionFailed { job_id: String },

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            DatabaseError::ConditionFailed { .. } => StoreErrorKind::Contention,
            DatabaseError::Transient(_) => StoreErrorKind::Transient,
            _ => StoreErrorKind::Other,
        }
    }

    /// Wrap a libSQL failure, treating lock/busy conditions as transient.
    pub fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let message = e.to_string();
        let lower = message.to_lowercase();
        if lower.contains("database is locked") || lower.contains("busy") {
            DatabaseError::Transient(format!("{op}: {message}"))
        } else {
            DatabaseError::Query(format!("{op}: {message}"))
        }
    }
}

/// Job model errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid {field} document on job {id}: {reason}")]
    InvalidDocument {
        id: String,
        field: &'static str,
        reason: String,
    },
}

/// Handler dispatch and command-building errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler found for job type {job_type}")]
    NoHandler { job_type: String },

    #[error("Invalid job_config for handler {handler}: {reason}")]
    InvalidConfig { handler: String, reason: String },

    #[error("Handler {handler} produced an empty command line")]
    EmptyCommand { handler: String },
}

/// Subprocess execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job tree errors.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Parent job {id} not found")]
    ParentNotFound { id: String },

    #[error("Could not append {child} to parent {parent} after {attempts} attempts")]
    AppendConflict {
        parent: String,
        child: String,
        attempts: u32,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
