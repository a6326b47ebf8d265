use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use millstone::context::JobContext;
use millstone::endpoint::{
    DEFAULT_PROTOCOL, ExecutorEndpoint, ExecutorIdentifier, SupervisorEndpoint,
};
use millstone::job::RunMode;

use crate::common::error::TaskmillError;

pub const ENV_JOB_CONTEXT: &str = "TASKMILL_JOB_CONTEXT";
pub const ENV_EXECUTOR_PORT: &str = "TASKMILL_EXECUTOR_PORT";
pub const ENV_REPORT_ENABLED: &str = "TASKMILL_REPORT_ENABLED";
pub const ENV_RUN_MODE: &str = "TASKMILL_RUN_MODE";
pub const ENV_LOG_DIR: &str = "TASKMILL_LOG_DIR";
pub const ENV_LOG_UPLOAD_DIR: &str = "TASKMILL_LOG_UPLOAD_DIR";
pub const ENV_SUPERVISOR_PORT: &str = "TASKMILL_SUPERVISOR_PORT";
pub const ENV_EXECUTOR_HOST: &str = "TASKMILL_EXECUTOR_HOST";
pub const ENV_EXECUTOR_NAME: &str = "TASKMILL_EXECUTOR_NAME";

/// Settings of the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFrameworkConfig {
    pub run_mode: RunMode,
    pub job_heartbeat_timeout_secs: u64,
    pub preparing_expire_secs: u64,
    pub resource_allocate_timeout_secs: u64,
    pub single_start_preparing_job_rows: usize,
    pub single_pull_result_job_rows: usize,
    pub single_fetch_stop_job_rows: usize,
    pub single_fetch_destroy_executor_job_rows: usize,
    pub single_fetch_abandoned_resource_rows: usize,
    pub start_rate_per_second: f64,
    pub start_rate_burst: u32,
    pub pull_result_workers: usize,
    pub pull_result_wait_check_secs: u64,
    pub start_preparing_interval_ms: u64,
    pub pull_result_interval_ms: u64,
    pub stop_interval_ms: u64,
    pub finish_interval_ms: u64,
    pub manage_resource_interval_ms: u64,
    /// Supervisor agents available to process executors.
    pub supervisor_endpoints: Vec<SupervisorEndpoint>,
    /// Base URLs executors report to.
    pub server_urls: Vec<String>,
    pub listen_port: u16,
    /// Advertised name of this host, defaults to the hostname.
    pub hostname: Option<String>,
    /// Whether executors push results; otherwise the control plane only pulls.
    pub report_enabled: bool,
    pub k8s: Option<K8sConfig>,
}

impl Default for TaskFrameworkConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Process,
            job_heartbeat_timeout_secs: 300,
            preparing_expire_secs: 600,
            resource_allocate_timeout_secs: 300,
            single_start_preparing_job_rows: 50,
            single_pull_result_job_rows: 200,
            single_fetch_stop_job_rows: 50,
            single_fetch_destroy_executor_job_rows: 50,
            single_fetch_abandoned_resource_rows: 50,
            start_rate_per_second: 10.0,
            start_rate_burst: 10,
            pull_result_workers: 8,
            pull_result_wait_check_secs: 30,
            start_preparing_interval_ms: 5_000,
            pull_result_interval_ms: 10_000,
            stop_interval_ms: 10_000,
            finish_interval_ms: 10_000,
            manage_resource_interval_ms: 10_000,
            supervisor_endpoints: vec![],
            server_urls: vec![],
            listen_port: 8989,
            hostname: None,
            report_enabled: true,
            k8s: None,
        }
    }
}

impl TaskFrameworkConfig {
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskmillError::GenericError(format!(
                "Cannot read configuration {}: {e}",
                path.display()
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn job_heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.job_heartbeat_timeout_secs)
    }

    pub fn preparing_expire(&self) -> Duration {
        Duration::from_secs(self.preparing_expire_secs)
    }

    pub fn resource_allocate_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_allocate_timeout_secs)
    }

    pub fn pull_result_wait_check(&self) -> Duration {
        Duration::from_secs(self.pull_result_wait_check_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct K8sConfig {
    pub namespace: String,
    /// Image running `taskmill supervisor`.
    pub image: String,
    pub supervisor_port: u16,
    pub region: String,
    pub group: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "taskmill:latest".to_string(),
            supervisor_port: 9000,
            region: "default".to_string(),
            group: "default".to_string(),
            cpu: None,
            memory: None,
        }
    }
}

/// Settings of a supervisor agent.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub listen_port: u16,
    pub hostname: String,
    pub log_dir: PathBuf,
    /// Program started for each executor, the current executable by default.
    pub executor_program: PathBuf,
    pub log_upload_dir: Option<PathBuf>,
    pub run_mode: RunMode,
    pub report_enabled: bool,
}

/// Settings of an executor process, read from the environment its supervisor set up.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub job_context: JobContext,
    pub host: String,
    pub executor_name: String,
    pub executor_port: u16,
    pub supervisor_port: u16,
    pub report_enabled: bool,
    pub run_mode: RunMode,
    pub log_dir: PathBuf,
    pub log_upload_dir: Option<PathBuf>,
    pub report_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl ExecutorConfig {
    pub fn from_env() -> crate::Result<Self> {
        let job_context: JobContext = serde_json::from_str(&required_env(ENV_JOB_CONTEXT)?)?;
        let executor_port = parse_env(ENV_EXECUTOR_PORT)?;
        let supervisor_port = parse_env(ENV_SUPERVISOR_PORT)?;
        let run_mode = required_env(ENV_RUN_MODE)?.parse()?;
        let report_enabled = std::env::var(ENV_REPORT_ENABLED)
            .map(|v| v != "false")
            .unwrap_or(true);
        Ok(Self {
            job_context,
            host: crate::common::utils::network::get_hostname(
                std::env::var(ENV_EXECUTOR_HOST).ok(),
            ),
            executor_name: required_env(ENV_EXECUTOR_NAME)?,
            executor_port,
            supervisor_port,
            report_enabled,
            run_mode,
            log_dir: PathBuf::from(required_env(ENV_LOG_DIR)?),
            log_upload_dir: std::env::var(ENV_LOG_UPLOAD_DIR).ok().map(PathBuf::from),
            report_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        })
    }
}

impl ExecutorConfig {
    /// Address of this executor. Its process id is the identifier namespace.
    pub fn endpoint(&self) -> ExecutorEndpoint {
        ExecutorEndpoint {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: self.host.clone(),
            supervisor_port: self.supervisor_port,
            executor_port: self.executor_port,
            identifier: ExecutorIdentifier::new(
                self.host.clone(),
                Some(self.executor_port),
                std::process::id().to_string(),
                self.executor_name.clone(),
            )
            .to_string(),
        }
    }
}

fn required_env(name: &str) -> crate::Result<String> {
    std::env::var(name)
        .map_err(|_| TaskmillError::GenericError(format!("Environment variable {name} is not set")))
}

fn parse_env<T: std::str::FromStr>(name: &str) -> crate::Result<T> {
    let value = required_env(name)?;
    value
        .parse()
        .map_err(|_| TaskmillError::GenericError(format!("Invalid value of {name}: `{value}`")))
}
