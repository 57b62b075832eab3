//! Job persistence.
//!
//! - `traits` — the [`JobDatabase`] backend trait
//! - `libsql_backend` — libSQL/SQLite implementation
//! - `migrations` — versioned schema
//! - `job_store` — retrying, version-checked job operations

pub mod job_store;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use job_store::{JobStore, MAX_APPEND_ATTEMPTS, MAX_LOG_ATTEMPTS};
pub use libsql_backend::LibSqlBackend;
pub use traits::{JobDatabase, JobPage, JobUpdate, UpdateCondition};
