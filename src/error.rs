// src/error.rs
//! Error taxonomy for the pipeline.
//!
//! Configuration and selection errors fail fast. Fetch and validation errors
//! are plain data: they are recorded in the run report and never interrupt
//! sibling work. Emission errors are surfaced to the caller.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The sources document could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading sources document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{origin}:{line}:{column}: {message}")]
    Parse {
        origin: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("unsupported sources document format `{0}` (expected toml or json)")]
    Format(String),
    #[error("sources document declares no sources")]
    Empty,
}

/// A selection named sources the registry does not know.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("unknown source(s): {}{}", .unknown.join(", "), render_suggestions(.suggestions))]
pub struct UnknownSourceError {
    pub unknown: Vec<String>,
    /// `(unknown, closest known name)` pairs.
    pub suggestions: Vec<(String, String)>,
}

fn render_suggestions(s: &[(String, String)]) -> String {
    if s.is_empty() {
        return String::new();
    }
    let hints = s
        .iter()
        .map(|(bad, good)| format!("{bad} -> {good}?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" (did you mean: {hints})")
}

/// Per-source fetch failure. Carried inside `FetchResult`, never raised.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    #[error("{url}: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url}: {message}")]
    Transport { url: String, message: String },
    #[error("timed out after {}ms", .after.as_millis())]
    Timeout {
        #[serde(serialize_with = "ser_millis")]
        after: Duration,
    },
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },
    #[error("automation failed for {url}: {message}")]
    Automation { url: String, message: String },
    #[error("unexpected fault")]
    Unexpected,
    #[error("all {failed} url(s) failed; first: {first}")]
    AllUrlsFailed { first: Box<FetchError>, failed: usize },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::AllUrlsFailed { first, .. } => first.is_timeout(),
            _ => false,
        }
    }
}

fn ser_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Per-item validation failure. Counted and dropped.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("{source_name}: item #{index} is missing required field `{field}`")]
    MissingField {
        source_name: String,
        index: usize,
        field: String,
    },
    #[error("{source_name}: item #{index} has no item name")]
    NoName { source_name: String, index: usize },
    #[error("{source_name}: item #{index} has unusable value `{raw}`")]
    BadValue {
        source_name: String,
        index: usize,
        raw: String,
    },
}

/// Writing report artifacts failed. The run report itself is intact and
/// emission can be retried.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("encoding json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fail-fast errors that stop a run before any fetch happens.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    UnknownSource(#[from] UnknownSourceError),
}
