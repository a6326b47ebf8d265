use thiserror::Error;

use millstone::JobId;
use millstone::resource::ResourceID;

use crate::common::error::TaskmillError::GenericError;

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Core error: {0}")]
    CoreError(#[from] millstone::Error),
    #[error("HTTP error: {0}")]
    HttpError(String),
    #[error("Kubernetes error: {0}")]
    KubeError(String),
    /// The resource is still reachable and cannot be destroyed yet, retry later.
    #[error("Resource {0} is busy and cannot be destroyed yet")]
    ResourceBusy(ResourceID),
    #[error("Job error: {0}")]
    JobError(String),
    #[error("Resource allocation of job {0} failed")]
    AllocationFailed(JobId),
    #[error("Logic error: {0}")]
    LogicError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl TaskmillError {
    pub fn is_resource_busy(&self) -> bool {
        matches!(self, TaskmillError::ResourceBusy(_))
    }
}

impl From<serde_json::error::Error> for TaskmillError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for TaskmillError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<reqwest::Error> for TaskmillError {
    fn from(error: reqwest::Error) -> Self {
        Self::HttpError(error.to_string())
    }
}

impl From<kube::Error> for TaskmillError {
    fn from(error: kube::Error) -> Self {
        Self::KubeError(error.to_string())
    }
}

impl From<anyhow::Error> for TaskmillError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for TaskmillError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
