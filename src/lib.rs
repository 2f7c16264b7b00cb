// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod report;

pub use crate::api::router;
pub use crate::error::{FetchError, PipelineError, UnknownSourceError};
pub use crate::ingest::{run_pipeline, Pipeline};
pub use crate::report::{RunOutcome, RunReport};
