use thiserror::Error;

use crate::job::{JobStatus, TaskStatus};

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum MillError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Illegal status transition: job is {current:?}, executor reported {reported:?}")]
    IllegalTransition {
        current: JobStatus,
        reported: TaskStatus,
    },
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for MillError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<url::ParseError> for MillError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidIdentifier(e.to_string())
    }
}

impl From<String> for MillError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for MillError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
