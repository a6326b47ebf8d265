use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::endpoint::ExecutorEndpoint;
use crate::ids::{JobId, UserId};
use crate::result::TaskResult;

/// Control-plane status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, waiting for a resource allocation request.
    Preparing,
    /// Allocation requested, waiting for a supervisor endpoint and executor start.
    PreparingResr,
    Running,
    /// Cancellation requested, stop signal not yet delivered.
    Canceling,
    /// Stop signal delivered, waiting for the executor's final report.
    DoCanceling,
    Timeout,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            JobStatus::Timeout | JobStatus::Done | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::PreparingResr => "PREPARING_RESR",
            JobStatus::Running => "RUNNING",
            JobStatus::Canceling => "CANCELING",
            JobStatus::DoCanceling => "DO_CANCELING",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task as seen by the executor running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Preparing,
    Running,
    Abnormal,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    /// Executors are local OS processes.
    Process,
    /// Executors run inside cluster pods.
    K8s,
}

impl RunMode {
    pub fn is_k8s(&self) -> bool {
        matches!(self, RunMode::K8s)
    }
}

impl Display for RunMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunMode::Process => "PROCESS",
            RunMode::K8s => "K8S",
        })
    }
}

impl FromStr for RunMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(RunMode::Process),
            "k8s" => Ok(RunMode::K8s),
            _ => Err(format!("Unknown run mode `{s}`").into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdentity {
    pub id: JobId,
}

impl JobIdentity {
    pub fn of(id: JobId) -> Self {
        Self { id }
    }
}

/// One persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub run_mode: RunMode,
    pub executor_identifier: Option<String>,
    pub executor_endpoint: Option<ExecutorEndpoint>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub finished_time: Option<DateTime<Utc>>,
    pub executor_destroyed_time: Option<DateTime<Utc>>,
    pub progress: f64,
    /// Last ingested [`TaskResult`], serialized.
    pub result_json: Option<String>,
    pub log_metadata: Map<String, String>,
    pub job_parameters: Map<String, String>,
    pub job_properties: Map<String, String>,
    pub organization_id: Option<u64>,
    pub creator_id: Option<UserId>,
}

impl Job {
    pub fn new(id: JobId, job_type: &str, run_mode: RunMode, create_time: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: job_type.to_string(),
            status: JobStatus::Preparing,
            run_mode,
            executor_identifier: None,
            executor_endpoint: None,
            last_heartbeat_time: None,
            create_time,
            finished_time: None,
            executor_destroyed_time: None,
            progress: 0.0,
            result_json: None,
            log_metadata: Default::default(),
            job_parameters: Default::default(),
            job_properties: Default::default(),
            organization_id: None,
            creator_id: None,
        }
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity::of(self.id)
    }

    /// Liveness is measured from the last heartbeat, or from creation if the
    /// executor never reported one.
    pub fn liveness_reference_time(&self) -> DateTime<Utc> {
        self.last_heartbeat_time.unwrap_or(self.create_time)
    }

    pub fn previous_result(&self) -> Option<TaskResult> {
        let json = self.result_json.as_deref()?;
        match serde_json::from_str(json) {
            Ok(result) => Some(result),
            Err(error) => {
                log::warn!(
                    "Stored result of job_id={} cannot be parsed: {error}",
                    self.id
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JobStatus, RunMode, TaskStatus};
    use std::str::FromStr;

    #[test]
    fn terminal_statuses() {
        let terminal: Vec<_> = [
            JobStatus::Preparing,
            JobStatus::PreparingResr,
            JobStatus::Running,
            JobStatus::Canceling,
            JobStatus::DoCanceling,
            JobStatus::Timeout,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Canceled,
        ]
        .into_iter()
        .filter(|s| s.is_terminated())
        .collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Timeout,
                JobStatus::Done,
                JobStatus::Failed,
                JobStatus::Canceled
            ]
        );
        assert!(!TaskStatus::Abnormal.is_terminated());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::PreparingResr).unwrap(),
            "\"PREPARING_RESR\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"DO_CANCELING\"").unwrap(),
            JobStatus::DoCanceling
        );
        assert_eq!(serde_json::to_string(&RunMode::K8s).unwrap(), "\"K8S\"");
    }

    #[test]
    fn parse_run_mode() {
        assert_eq!(RunMode::from_str("K8S").unwrap(), RunMode::K8s);
        assert_eq!(RunMode::from_str("process").unwrap(), RunMode::Process);
        assert!(RunMode::from_str("yarn").is_err());
    }
}
