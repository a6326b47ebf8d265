use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::endpoint::ExecutorEndpoint;
use crate::job::{JobIdentity, TaskStatus};

/// Snapshot of a task's state, pushed by the executor or pulled from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub job_identity: JobIdentity,
    pub status: TaskStatus,
    pub progress: f64,
    pub result_json: Option<String>,
    #[serde(default)]
    pub log_metadata: Map<String, String>,
    pub executor_endpoint: Option<ExecutorEndpoint>,
    pub error_message: Option<String>,
    pub organization_id: Option<u64>,
}

impl TaskResult {
    pub fn new(job_identity: JobIdentity, status: TaskStatus) -> Self {
        Self {
            job_identity,
            status,
            progress: 0.0,
            result_json: None,
            log_metadata: Default::default(),
            executor_endpoint: None,
            error_message: None,
            organization_id: None,
        }
    }

    /// Returns true if this result differs from `previous` in anything the control
    /// plane persists: status, progress, log metadata or the result payload.
    pub fn progress_changed(&self, previous: Option<&TaskResult>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        self.status != previous.status
            || self.progress != previous.progress
            || self.log_metadata != previous.log_metadata
            || self.result_json != previous.result_json
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub job_identity: JobIdentity,
    pub executor_endpoint: Option<ExecutorEndpoint>,
}
