//! Delphi job orchestrator — versioned job store, poll/dispatch worker,
//! subprocess monitor, and job-tree bookkeeping.

pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod jobs;
pub mod safety;
pub mod store;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Error, Result};
