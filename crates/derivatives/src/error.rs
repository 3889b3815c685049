use std::path::PathBuf;

use neuroflow_common::{CommonError, Role};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Required file '{role}' not resolved: {found} matches for {pattern:?} under {}", root.display())]
    MissingFile {
        role: Role,
        pattern: String,
        root: PathBuf,
        found: usize,
    },

    #[error("Role '{0}' is required but was not resolved")]
    UnresolvedRole(Role),

    #[error("Atlas {0:?} is not available")]
    InvalidAtlas(String),

    #[error("Invalid measure: {0:?}")]
    InvalidMeasure(String),

    #[error("Metric {metric:?} is not produced by {software}")]
    InvalidMetric { metric: String, software: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid label table {}: {reason}", path.display())]
    LabelTable { path: PathBuf, reason: String },

    #[error("FreeSurfer license file not found: {0}")]
    License(String),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("External tool failure: {0}")]
    Tool(#[from] drivers::ToolError),

    #[error("Invalid role pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Failures that only concern one stage invocation and can be retried
    /// later without touching other outputs
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Tool(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
