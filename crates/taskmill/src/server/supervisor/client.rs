use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use millstone::JobId;
use millstone::context::JobContext;
use millstone::endpoint::{ExecutorEndpoint, SupervisorEndpoint};
use millstone::messages::{
    DestroyTaskRequest, LogQuery, ProcessConfig, RpcResponse, SUPERVISOR_DESTROY_PATH,
    SUPERVISOR_HEARTBEAT_PATH, SUPERVISOR_START_PATH, StartTaskRequest, TaskCallerResult,
    executor_log_path, executor_result_path, executor_stop_path,
};
use millstone::result::TaskResult;

use crate::common::error::TaskmillError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to supervisor agents, and the direct stop sent to executors.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    /// Starts an executor for the job; remote failures surface as [`TaskmillError::JobError`].
    async fn start_task(
        &self,
        supervisor: &SupervisorEndpoint,
        job_context: &JobContext,
        process_config: &ProcessConfig,
    ) -> crate::Result<ExecutorEndpoint>;

    async fn stop_task_directly(
        &self,
        executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult;

    async fn destroy_task(
        &self,
        supervisor: &SupervisorEndpoint,
        executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult;

    async fn is_supervisor_alive(&self, supervisor: &SupervisorEndpoint) -> bool;
}

/// Queries served by an executor's embedded server.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn get_result(&self, executor: &ExecutorEndpoint, job_id: JobId)
    -> crate::Result<TaskResult>;

    async fn get_log(
        &self,
        executor: &ExecutorEndpoint,
        job_id: JobId,
        query: &LogQuery,
    ) -> crate::Result<String>;
}

/// HTTP implementation of [`SupervisorClient`] and [`ExecutorClient`].
#[derive(Clone)]
pub struct HttpTaskClient {
    client: reqwest::Client,
}

impl HttpTaskClient {
    pub fn new() -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> crate::Result<R> {
        let response: RpcResponse<R> = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result().map_err(TaskmillError::JobError)
    }

    async fn get<R: DeserializeOwned>(&self, url: &str) -> crate::Result<R> {
        let response: RpcResponse<R> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result().map_err(TaskmillError::JobError)
    }
}

#[async_trait]
impl SupervisorClient for HttpTaskClient {
    async fn start_task(
        &self,
        supervisor: &SupervisorEndpoint,
        job_context: &JobContext,
        process_config: &ProcessConfig,
    ) -> crate::Result<ExecutorEndpoint> {
        let request = StartTaskRequest {
            job_context: job_context.clone(),
            process_config: process_config.clone(),
        };
        let url = format!("{}{SUPERVISOR_START_PATH}", supervisor.base_url());
        self.post(&url, &request).await.map_err(|error| {
            TaskmillError::JobError(format!(
                "Starting task on supervisor {supervisor} failed ({}): {error}",
                job_context.trace
            ))
        })
    }

    async fn stop_task_directly(
        &self,
        executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult {
        let url = format!(
            "{}{}",
            executor.base_url(),
            executor_stop_path(job_context.job_id())
        );
        match self.post::<_, bool>(&url, &job_context.trace).await {
            Ok(true) => TaskCallerResult::success(),
            Ok(false) => TaskCallerResult::failed("executor refused to stop the task"),
            Err(error) => TaskCallerResult::failed(error),
        }
    }

    async fn destroy_task(
        &self,
        supervisor: &SupervisorEndpoint,
        executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult {
        let request = DestroyTaskRequest {
            job_context: job_context.clone(),
            executor_endpoint: executor.clone(),
        };
        let url = format!("{}{SUPERVISOR_DESTROY_PATH}", supervisor.base_url());
        match self.post::<_, bool>(&url, &request).await {
            Ok(_) => TaskCallerResult::success(),
            Err(error) => TaskCallerResult::failed(error),
        }
    }

    async fn is_supervisor_alive(&self, supervisor: &SupervisorEndpoint) -> bool {
        let url = format!("{}{SUPERVISOR_HEARTBEAT_PATH}", supervisor.base_url());
        let response = self.client.get(&url).timeout(ALIVE_TIMEOUT).send().await;
        match response {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                log::debug!("Supervisor {supervisor} is not reachable: {error}");
                false
            }
        }
    }
}

#[async_trait]
impl ExecutorClient for HttpTaskClient {
    async fn get_result(
        &self,
        executor: &ExecutorEndpoint,
        job_id: JobId,
    ) -> crate::Result<TaskResult> {
        let url = format!("{}{}", executor.base_url(), executor_result_path(job_id));
        self.get(&url).await
    }

    async fn get_log(
        &self,
        executor: &ExecutorEndpoint,
        job_id: JobId,
        query: &LogQuery,
    ) -> crate::Result<String> {
        let url = format!("{}{}", executor.base_url(), executor_log_path(job_id));
        let mut request = self
            .client
            .get(&url)
            .query(&[("logType", query.log_type.to_string())]);
        if let Some(lines) = query.fetch_max_line {
            request = request.query(&[("fetchMaxLine", lines)]);
        }
        if let Some(bytes) = query.fetch_max_byte_size {
            request = request.query(&[("fetchMaxByteSize", bytes)]);
        }
        let response: RpcResponse<String> =
            request.send().await?.error_for_status()?.json().await?;
        response.into_result().map_err(TaskmillError::JobError)
    }
}
