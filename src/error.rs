use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A violated run parameter constraint.
///
/// Returned by every [`ParameterValidator`](crate::core::validator::ParameterValidator)
/// and by [`JobParameters::from_args`](crate::core::parameters::JobParameters::from_args)
/// when a token cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Name of the offending parameter
    pub parameter: String,
    /// Human-readable description of the violated constraint
    pub message: String,
}

impl ValidationError {
    pub fn new(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter '{}': {}", self.parameter, self.message)
    }
}

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    #[error("Invalid job parameters: {0}")]
    Validation(ValidationError),

    #[error("PagedSource: {0}")]
    Source(String),

    #[error("RecordTransformer: {0}")]
    Transform(String),

    #[error("BatchSink: {0}")]
    Sink(String),

    #[error("Tasklet: {0}")]
    Tasklet(String),

    #[error("JobRepository: {0}")]
    Repository(String),

    #[error("Checkpoint: {0}")]
    Checkpoint(String),

    #[error("Configuration: {0}")]
    Configuration(String),

    #[error("Job instance already complete: {job} ({parameters})")]
    JobInstanceAlreadyComplete { job: String, parameters: String },

    #[error("Step: {0}")]
    Step(String),
}

impl From<ValidationError> for BatchError {
    fn from(error: ValidationError) -> Self {
        BatchError::Validation(error)
    }
}
