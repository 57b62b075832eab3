//! Job handlers.
//!
//! A handler maps a job to a command line; [`Handler::process`] runs it
//! through the executor and records the outcome.

pub mod batch_status;
pub mod handler;
pub mod narrative;
pub mod pipeline;
pub mod registry;

pub use batch_status::BatchStatusHandler;
pub use handler::{Handler, HandlerContext, RESERVED_ENV_NAMES, prepare_environment};
pub use narrative::NarrativeBatchHandler;
pub use pipeline::PipelineJobHandler;
pub use registry::HandlerRegistry;
