use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::Map;
use crate::ids::{JobId, UserId};
use crate::job::{Job, JobIdentity};

/// Identifies the job and user a request acts for. Passed explicitly through every
/// supervisor and executor call and rendered into log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub job_id: JobId,
    pub user_id: Option<UserId>,
}

impl TraceContext {
    pub fn new(job_id: JobId, user_id: Option<UserId>) -> Self {
        Self { job_id, user_id }
    }
}

impl Display for TraceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_id={}", self.job_id)?;
        if let Some(user_id) = self.user_id {
            write!(f, " user_id={user_id}")?;
        }
        Ok(())
    }
}

/// Everything an executor needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    pub job_identity: JobIdentity,
    pub job_type: String,
    #[serde(default)]
    pub job_parameters: Map<String, String>,
    #[serde(default)]
    pub job_properties: Map<String, String>,
    /// Control-plane base URLs the executor reports to, tried in order.
    #[serde(default)]
    pub host_urls: Vec<String>,
    pub trace: TraceContext,
}

impl JobContext {
    pub fn from_job(job: &Job, host_urls: Vec<String>) -> Self {
        Self {
            job_identity: job.identity(),
            job_type: job.job_type.clone(),
            job_parameters: job.job_parameters.clone(),
            job_properties: job.job_properties.clone(),
            host_urls,
            trace: TraceContext::new(job.id, job.creator_id),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_identity.id
    }
}
