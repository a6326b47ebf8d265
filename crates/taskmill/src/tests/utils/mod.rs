use chrono::{DateTime, TimeZone, Utc};

use millstone::common::clock::ManualClock;
use millstone::context::JobContext;
use millstone::endpoint::{ExecutorEndpoint, ExecutorIdentifier};
use millstone::job::{Job, JobStatus};

pub mod env;
pub mod job;
pub mod mocks;

pub use env::TestEnv;
pub use job::JobBuilder;
pub use mocks::{MockPodClient, MockResourceStrategy, MockSupervisorClient};

pub const TEST_HOSTNAME: &str = "node-test";

pub fn test_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Clock frozen at [`test_start_time`] until advanced.
pub fn test_clock() -> ManualClock {
    ManualClock::new(test_start_time())
}

pub fn create_job(job_id: u64, status: JobStatus) -> Job {
    JobBuilder::default().id(job_id).status(status).build()
}

pub fn job_context(job: &Job) -> JobContext {
    JobContext::from_job(job, vec!["http://127.0.0.1:8989".to_string()])
}

/// Endpoint of an executor started by the supervisor at `node-1:9000`.
pub fn executor_endpoint(job_id: u64) -> ExecutorEndpoint {
    executor_on("node-1", 9000, job_id)
}

pub fn executor_on(host: &str, supervisor_port: u16, job_id: u64) -> ExecutorEndpoint {
    let executor_port = 20_000 + job_id as u16;
    ExecutorEndpoint {
        protocol: "http".to_string(),
        host: host.to_string(),
        supervisor_port,
        executor_port,
        identifier: ExecutorIdentifier::new(
            host,
            Some(executor_port),
            (1000 + job_id).to_string(),
            format!("task-{job_id}"),
        )
        .to_string(),
    }
}

#[allow(unused)]
pub fn enable_test_logging() {
    env_logger::builder().is_test(true).init()
}
