//! Ordered handler lookup.

use std::sync::Arc;

use crate::config::HandlerConfig;
use crate::handlers::{BatchStatusHandler, Handler, NarrativeBatchHandler, PipelineJobHandler};
use crate::jobs::Job;

/// Handlers checked in registration order; the first match wins.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// The built-in handlers. Narrative submission is checked before the
    /// batch status poller so the legacy tag resolves by status.
    pub fn with_defaults(config: &HandlerConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PipelineJobHandler::new(config)));
        registry.register(Arc::new(NarrativeBatchHandler::new(config)));
        registry.register(Arc::new(BatchStatusHandler::new(config)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        tracing::debug!(handler = handler.name(), "Registered handler");
        self.handlers.push(handler);
    }

    /// First handler whose `can_handle` accepts `job`.
    pub fn find(&self, job: &Job) -> Option<Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.can_handle(job)).cloned()
    }

    /// Registered handler names, in lookup order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::jobs::{JobStatus, JobType, NewJob};

    fn job(job_type: JobType, status: JobStatus) -> Job {
        let mut job = NewJob::new("c", job_type).into_job(60);
        job.status = status;
        job
    }

    #[test]
    fn dispatch_by_type_and_status() {
        let registry = HandlerRegistry::with_defaults(&HandlerConfig::default());
        let name = |t, s| registry.find(&job(t, s)).map(|h| h.name());

        assert_eq!(name(JobType::FullPipeline, JobStatus::Pending), Some("pipeline"));
        assert_eq!(
            name(JobType::CreateNarrativeBatch, JobStatus::Pending),
            Some("narrative_batch")
        );
        assert_eq!(
            name(JobType::NarrativeBatch, JobStatus::Pending),
            Some("narrative_batch")
        );
        assert_eq!(
            name(JobType::NarrativeBatch, JobStatus::Processing),
            Some("batch_status")
        );
        assert_eq!(
            name(JobType::AwaitingNarrativeBatch, JobStatus::Processing),
            Some("batch_status")
        );
        assert_eq!(name(JobType::NarrativeBatch, JobStatus::Completed), None);
    }

    struct CatchAll;

    impl Handler for CatchAll {
        fn name(&self) -> &'static str {
            "catch_all"
        }
        fn can_handle(&self, _job: &Job) -> bool {
            true
        }
        fn build_command(&self, _job: &Job) -> Result<Vec<String>, HandlerError> {
            Ok(vec!["true".into()])
        }
    }

    #[test]
    fn first_registered_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CatchAll));
        registry.register(Arc::new(PipelineJobHandler::new(&HandlerConfig::default())));

        let found = registry
            .find(&job(JobType::FullPipeline, JobStatus::Pending))
            .unwrap();
        assert_eq!(found.name(), "catch_all");
        assert_eq!(registry.names(), vec!["catch_all", "pipeline"]);
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = HandlerRegistry::default();
        assert!(registry.is_empty());
        assert!(
            registry
                .find(&job(JobType::FullPipeline, JobStatus::Pending))
                .is_none()
        );
    }
}
