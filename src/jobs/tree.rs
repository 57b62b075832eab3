//! Job lineage: child creation, tree lookup, validation and repair.
//!
//! A tree is every job sharing one `root_job_id`. Validation reports
//! structural errors (wrong root, dangling parent) separately from
//! bookkeeping warnings (a parent's `child_jobs` out of step with the
//! children that name it). Only the latter are repairable.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{DatabaseError, StoreErrorKind, TreeError};
use crate::jobs::{Job, JobType, NewJob};
use crate::store::{JobStore, MAX_APPEND_ATTEMPTS};

/// Rows fetched per lineage-index page.
const TREE_PAGE_SIZE: usize = 100;

/// Parameters for a child job. Unset fields are inherited from the parent.
#[derive(Debug, Clone, Default)]
pub struct ChildJobRequest {
    pub job_type: JobType,
    pub job_id: Option<String>,
    pub conversation_id: Option<String>,
    pub report_id: Option<String>,
    pub priority: Option<i64>,
    pub job_stage: Option<String>,
    pub job_config: Option<serde_json::Value>,
    pub timeout_seconds: Option<u64>,
    pub environment: BTreeMap<String, String>,
}

/// All jobs in one lineage.
#[derive(Debug, Clone, Serialize)]
pub struct JobTreeView {
    pub root_job_id: String,
    pub jobs: Vec<Job>,
}

/// One finding from [`JobTree::validate_job_tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeIssue {
    /// A member's `root_job_id` differs from the tree's root.
    RootMismatch {
        job_id: String,
        root_job_id: String,
        expected_root: String,
    },
    /// A member's `parent_job_id` is not in the tree.
    MissingParent {
        job_id: String,
        parent_job_id: String,
    },
    /// A child names the parent but the parent's `child_jobs` omits it.
    ChildNotListed {
        parent_job_id: String,
        child_job_id: String,
    },
    /// A parent's `child_jobs` lists a job that is not in the tree.
    UnknownChild {
        parent_job_id: String,
        child_job_id: String,
    },
}

impl fmt::Display for TreeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeIssue::RootMismatch {
                job_id,
                root_job_id,
                expected_root,
            } => write!(
                f,
                "Job {job_id} has root_job_id {root_job_id}, expected {expected_root}"
            ),
            TreeIssue::MissingParent {
                job_id,
                parent_job_id,
            } => write!(f, "Job {job_id} references missing parent {parent_job_id}"),
            TreeIssue::ChildNotListed {
                parent_job_id,
                child_job_id,
            } => write!(
                f,
                "Parent {parent_job_id} does not list child {child_job_id} in child_jobs"
            ),
            TreeIssue::UnknownChild {
                parent_job_id,
                child_job_id,
            } => write!(
                f,
                "Parent {parent_job_id} lists child {child_job_id}, which is not in the tree"
            ),
        }
    }
}

/// Result of validating one tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeReport {
    pub root_job_id: String,
    pub job_count: usize,
    pub errors: Vec<TreeIssue>,
    pub warnings: Vec<TreeIssue>,
}

impl TreeReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// A repair write that did not go through.
#[derive(Debug, Clone, Serialize)]
pub struct RepairFailure {
    pub issue: TreeIssue,
    pub error: String,
}

/// Outcome of [`JobTree::repair_job_tree`].
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub validation: TreeReport,
    pub dry_run: bool,
    pub fixed: Vec<TreeIssue>,
    pub failed: Vec<RepairFailure>,
}

/// Lineage operations over a [`JobStore`].
pub struct JobTree {
    store: Arc<JobStore>,
}

impl JobTree {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Submit a child of `parent_job_id` and record it in the parent's `child_jobs`.
    pub async fn create_child_job(
        &self,
        parent_job_id: &str,
        request: ChildJobRequest,
    ) -> Result<Job, TreeError> {
        let parent = self
            .store
            .get_job(parent_job_id)
            .await?
            .ok_or_else(|| TreeError::ParentNotFound {
                id: parent_job_id.to_string(),
            })?;

        let root_job_id = if parent.root_job_id.is_empty() {
            parent.job_id.clone()
        } else {
            parent.root_job_id.clone()
        };

        let new_job = NewJob {
            job_id: request.job_id,
            conversation_id: request
                .conversation_id
                .unwrap_or_else(|| parent.conversation_id.clone()),
            report_id: request.report_id.or_else(|| parent.report_id.clone()),
            job_type: request.job_type,
            priority: request.priority.unwrap_or(parent.priority),
            job_config: request.job_config,
            parent_job_id: Some(parent.job_id.clone()),
            root_job_id: Some(root_job_id),
            job_stage: request.job_stage,
            timeout_seconds: request.timeout_seconds,
            environment: request.environment,
            ..Default::default()
        };

        let child = self.store.submit_job(new_job).await?;

        self.store
            .append_child_job(&parent.job_id, &child.job_id)
            .await
            .map_err(|e| append_error(e, &parent.job_id, &child.job_id))?;

        info!(
            parent_job_id = %parent.job_id,
            child_job_id = %child.job_id,
            root_job_id = %child.root_job_id,
            "Child job created"
        );
        Ok(child)
    }

    /// Every job in the tree containing `job_id` (which may be the root or any member).
    pub async fn get_job_tree(&self, job_id: &str) -> Result<JobTreeView, TreeError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| TreeError::JobNotFound {
                id: job_id.to_string(),
            })?;
        let root_job_id = if job.root_job_id.is_empty() {
            job.job_id.clone()
        } else {
            job.root_job_id.clone()
        };

        let mut jobs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .jobs_for_root(&root_job_id, cursor.as_deref(), TREE_PAGE_SIZE)
                .await?;
            jobs.extend(page.jobs);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if jobs.is_empty() {
            return Ok(JobTreeView {
                root_job_id,
                jobs: vec![job],
            });
        }

        // The root row is indexed under its own root_job_id, which may be wrong.
        if !jobs.iter().any(|j| j.job_id == root_job_id) {
            if let Some(root) = self.store.get_job(&root_job_id).await? {
                jobs.insert(0, root);
            }
        }

        Ok(JobTreeView { root_job_id, jobs })
    }

    /// Check lineage consistency for the tree containing `job_id`.
    pub async fn validate_job_tree(&self, job_id: &str) -> Result<TreeReport, TreeError> {
        let tree = self.get_job_tree(job_id).await?;
        Ok(validate_jobs(&tree.root_job_id, &tree.jobs))
    }

    /// Validate and, when `fix_issues` is set, add missing children to their
    /// parents' `child_jobs`. A dry run never writes.
    pub async fn repair_job_tree(
        &self,
        job_id: &str,
        fix_issues: bool,
    ) -> Result<RepairReport, TreeError> {
        let validation = self.validate_job_tree(job_id).await?;
        let mut report = RepairReport {
            validation,
            dry_run: !fix_issues,
            fixed: Vec::new(),
            failed: Vec::new(),
        };
        if !fix_issues || report.validation.is_valid() {
            return Ok(report);
        }

        for issue in report.validation.warnings.clone() {
            let TreeIssue::ChildNotListed {
                ref parent_job_id,
                ref child_job_id,
            } = issue
            else {
                continue;
            };

            match self
                .store
                .append_child_job(parent_job_id, child_job_id)
                .await
            {
                Ok(_) => {
                    info!(parent_job_id, child_job_id, "Repaired child_jobs entry");
                    report.fixed.push(issue);
                }
                Err(e) => {
                    warn!(parent_job_id, child_job_id, error = %e, "Failed to repair child_jobs entry");
                    report.failed.push(RepairFailure {
                        issue,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

fn append_error(e: DatabaseError, parent: &str, child: &str) -> TreeError {
    if e.kind() == StoreErrorKind::Contention {
        TreeError::AppendConflict {
            parent: parent.to_string(),
            child: child.to_string(),
            attempts: MAX_APPEND_ATTEMPTS,
        }
    } else {
        TreeError::Database(e)
    }
}

/// Validate a set of jobs that should all share `root_job_id`.
pub fn validate_jobs(root_job_id: &str, jobs: &[Job]) -> TreeReport {
    let by_id: HashMap<&str, &Job> = jobs.iter().map(|j| (j.job_id.as_str(), j)).collect();
    let mut report = TreeReport {
        root_job_id: root_job_id.to_string(),
        job_count: jobs.len(),
        ..Default::default()
    };

    for job in jobs {
        if job.root_job_id != root_job_id {
            report.errors.push(TreeIssue::RootMismatch {
                job_id: job.job_id.clone(),
                root_job_id: job.root_job_id.clone(),
                expected_root: root_job_id.to_string(),
            });
        }

        if let Some(parent_id) = &job.parent_job_id {
            match by_id.get(parent_id.as_str()) {
                None => report.errors.push(TreeIssue::MissingParent {
                    job_id: job.job_id.clone(),
                    parent_job_id: parent_id.clone(),
                }),
                Some(parent) if !parent.child_jobs.contains(&job.job_id) => {
                    report.warnings.push(TreeIssue::ChildNotListed {
                        parent_job_id: parent_id.clone(),
                        child_job_id: job.job_id.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for child_id in &job.child_jobs {
            if !by_id.contains_key(child_id.as_str()) {
                report.warnings.push(TreeIssue::UnknownChild {
                    parent_job_id: job.job_id.clone(),
                    child_job_id: child_id.clone(),
                });
            }
        }
    }

    report
}
