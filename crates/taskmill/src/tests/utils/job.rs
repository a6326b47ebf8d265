use derive_builder::Builder;

use millstone::JobId;
use millstone::job::{Job, JobStatus, RunMode};

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct JobConfig {
    id: u64,
    #[builder(default = "JobStatus::Preparing")]
    status: JobStatus,
    #[builder(default = "RunMode::Process")]
    run_mode: RunMode,
    #[builder(default = "\"command\".to_string()")]
    job_type: String,
    #[builder(default)]
    parameters: Vec<(String, String)>,
}

pub type JobBuilder = JobConfigBuilder;

impl JobConfigBuilder {
    pub fn parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .get_or_insert_with(Vec::new)
            .push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> Job {
        let JobConfig {
            id,
            status,
            run_mode,
            job_type,
            parameters,
        } = self.finish().unwrap();
        let mut job = Job::new(JobId::new(id), &job_type, run_mode, super::test_start_time());
        job.status = status;
        job.job_parameters.extend(parameters);
        job
    }
}
