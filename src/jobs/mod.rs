//! Job entity and lineage bookkeeping.

pub mod model;
pub mod tree;

pub use model::{
    Job, JobRecord, JobStatus, JobType, LogEntry, LogLevel, NewJob, ResultType, format_timestamp,
    parse_timestamp,
};
pub use tree::{ChildJobRequest, JobTree, JobTreeView, RepairReport, TreeIssue, TreeReport};
