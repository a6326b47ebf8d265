//! Payloads exchanged between the control plane, supervisor agents and executors.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::context::JobContext;
use crate::endpoint::ExecutorEndpoint;

pub const REPORT_RESULT_PATH: &str = "/api/v2/task/result";
pub const REPORT_HEARTBEAT_PATH: &str = "/api/v2/task/heartbeat";

pub const SUPERVISOR_START_PATH: &str = "/supervisor/tasks/start";
pub const SUPERVISOR_DESTROY_PATH: &str = "/supervisor/tasks/destroy";
pub const SUPERVISOR_HEARTBEAT_PATH: &str = "/supervisor/heartbeat";

pub fn executor_log_path(job_id: impl Display) -> String {
    format!("/{job_id}/tasks/log")
}

pub fn executor_stop_path(job_id: impl Display) -> String {
    format!("/{job_id}/tasks/stop")
}

pub fn executor_result_path(job_id: impl Display) -> String {
    format!("/{job_id}/tasks/result")
}

/// Generic response envelope of every HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse<T> {
    pub successful: bool,
    pub data: Option<T>,
    pub error_message: Option<String>,
}

impl<T> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            successful: true,
            data: Some(data),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            data: None,
            error_message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.successful, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("response carried no data".to_string()),
            (false, _) => Err(self
                .error_message
                .unwrap_or_else(|| "unknown remote error".to_string())),
        }
    }
}

/// Launch settings of an executor process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    #[serde(default)]
    pub environments: Map<String, String>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskRequest {
    pub job_context: JobContext,
    pub process_config: ProcessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyTaskRequest {
    pub job_context: JobContext,
    pub executor_endpoint: ExecutorEndpoint,
}

/// Outcome of a best-effort supervisor/executor command. A present error is a
/// soft failure, retried on a later tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCallerResult {
    pub succeed: bool,
    pub error: Option<String>,
}

impl TaskCallerResult {
    pub fn success() -> Self {
        Self {
            succeed: true,
            error: None,
        }
    }

    pub fn failed(error: impl Display) -> Self {
        Self {
            succeed: false,
            error: Some(error.to_string()),
        }
    }

    pub fn is_soft_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    All,
    Warn,
}

impl LogType {
    pub fn file_name(&self) -> &'static str {
        match self {
            LogType::All => "all.log",
            LogType::Warn => "warn.log",
        }
    }

    pub fn all() -> [LogType; 2] {
        [LogType::All, LogType::Warn]
    }
}

impl Display for LogType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogType::All => "ALL",
            LogType::Warn => "WARN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub log_type: LogType,
    pub fetch_max_line: Option<usize>,
    pub fetch_max_byte_size: Option<usize>,
}
