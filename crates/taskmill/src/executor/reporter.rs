use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use millstone::messages::{REPORT_HEARTBEAT_PATH, REPORT_RESULT_PATH, RpcResponse};
use millstone::result::{HeartbeatRequest, TaskResult};

use crate::common::error::TaskmillError;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes task state from an executor to the control plane.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    /// Returns true once a control-plane host accepted the result.
    async fn report_result(&self, result: &TaskResult) -> bool;

    async fn report_heartbeat(&self, request: &HeartbeatRequest) -> bool;
}

/// Reports over HTTP, trying the control-plane hosts in order until one accepts.
pub struct TaskReporter {
    host_urls: Vec<String>,
    client: reqwest::Client,
}

impl TaskReporter {
    pub fn new(host_urls: Vec<String>) -> crate::Result<Self> {
        let client = reqwest::Client::builder().timeout(REPORT_TIMEOUT).build()?;
        Ok(Self { host_urls, client })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> bool {
        if self.host_urls.is_empty() {
            log::warn!("No control plane host is configured, nothing was reported");
            return false;
        }
        for host in &self.host_urls {
            let url = format!("{}{path}", host.trim_end_matches('/'));
            match self.post_to(&url, body).await {
                Ok(()) => return true,
                Err(error) => log::warn!("Reporting to {url} failed: {error}"),
            }
        }
        false
    }

    async fn post_to<B: Serialize + Sync>(&self, url: &str, body: &B) -> crate::Result<()> {
        let response: RpcResponse<bool> = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.successful {
            Ok(())
        } else {
            Err(TaskmillError::JobError(
                response
                    .error_message
                    .unwrap_or_else(|| "report was rejected".to_string()),
            ))
        }
    }
}

#[async_trait]
impl ResultReporter for TaskReporter {
    async fn report_result(&self, result: &TaskResult) -> bool {
        self.post(REPORT_RESULT_PATH, result).await
    }

    async fn report_heartbeat(&self, request: &HeartbeatRequest) -> bool {
        self.post(REPORT_HEARTBEAT_PATH, request).await
    }
}
