use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use millstone::job::{Job, JobStatus};

use crate::common::error::TaskmillError;
use crate::server::alarm::{TASK_LOGIC_ERROR, TASK_STOP_FAILED};
use crate::server::daemon::{Daemon, DaemonContext, millis};

/// Asks executors of canceled jobs to stop and fails timed out jobs that never started.
pub struct StopDaemon {
    ctx: Arc<DaemonContext>,
}

impl StopDaemon {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    async fn stop_job(&self, job: &Job) -> crate::Result<()> {
        if let Some(executor) = &job.executor_endpoint {
            let result = self
                .ctx
                .supervisor_client
                .stop_task_directly(executor, &self.ctx.job_context(job))
                .await;
            if result.is_soft_failure() {
                let error = result.error.unwrap_or_default();
                log::warn!("Stopping executor of job_id={} failed: {error}", job.id);
                self.ctx.alarm_job(TASK_STOP_FAILED, job, error);
            }
        }

        match job.status {
            JobStatus::Canceling => {
                let rows = self.ctx.store.update_status_by_id_old_status(
                    job.id,
                    JobStatus::Canceling,
                    JobStatus::DoCanceling,
                );
                if rows > 0 {
                    log::info!("Job job_id={} is being canceled", job.id);
                }
            }
            // The finish daemon tears the executor down
            JobStatus::Timeout if job.executor_endpoint.is_some() => {}
            JobStatus::Timeout => {
                // Never started, nothing will ever report a result
                self.ctx.terminate_job(job, JobStatus::Failed);
            }
            status => {
                return Err(TaskmillError::LogicError(format!(
                    "Job job_id={} cannot be stopped in status {status}",
                    job.id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Daemon for StopDaemon {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn interval(&self) -> Duration {
        millis(self.ctx.config.stop_interval_ms)
    }

    async fn tick(&self) {
        let page = self
            .ctx
            .store
            .find_need_stopped_jobs(0, self.ctx.config.single_fetch_stop_job_rows);
        for job in page.items {
            if let Err(error) = self.stop_job(&job).await {
                log::error!("Stopping job job_id={} failed: {error}", job.id);
                self.ctx.alarm_job(TASK_LOGIC_ERROR, &job, &error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StopDaemon;
    use crate::server::alarm::TASK_STOP_FAILED;
    use crate::server::daemon::Daemon;
    use crate::tests::utils::{TestEnv, create_job, executor_endpoint};
    use millstone::JobId;
    use millstone::job::JobStatus;

    fn job_with_executor(env: &TestEnv, job_id: u64, status: JobStatus) {
        let mut job = create_job(job_id, status);
        job.executor_endpoint = Some(executor_endpoint(job_id));
        env.insert_job(job);
    }

    #[tokio::test]
    async fn canceling_job_is_stopped() {
        let env = TestEnv::new(|_| {});
        job_with_executor(&env, 1, JobStatus::Canceling);

        StopDaemon::new(env.ctx.clone()).tick().await;

        assert_eq!(env.status(1), JobStatus::DoCanceling);
        assert_eq!(env.supervisor.stopped(), vec![JobId::new(1)]);
        assert!(env.alarms.events().is_empty());
    }

    #[tokio::test]
    async fn failed_stop_still_moves_on() {
        let env = TestEnv::new(|_| {});
        job_with_executor(&env, 1, JobStatus::Canceling);
        env.supervisor.fail_stop("connection refused");

        StopDaemon::new(env.ctx.clone()).tick().await;

        assert_eq!(env.status(1), JobStatus::DoCanceling);
        assert_eq!(env.alarms.events(), vec![TASK_STOP_FAILED.to_string()]);
    }

    #[tokio::test]
    async fn timed_out_job_without_executor_fails() {
        let env = TestEnv::new(|_| {});
        env.insert_job(create_job(1, JobStatus::Timeout));

        StopDaemon::new(env.ctx.clone()).tick().await;

        assert_eq!(env.status(1), JobStatus::Failed);
        assert!(env.supervisor.stopped().is_empty());
        assert_eq!(env.terminate_events(), vec![(JobId::new(1), JobStatus::Failed)]);
    }

    #[tokio::test]
    async fn timed_out_job_with_executor_is_left_to_finish() {
        let env = TestEnv::new(|_| {});
        job_with_executor(&env, 1, JobStatus::Timeout);

        StopDaemon::new(env.ctx.clone()).tick().await;

        assert_eq!(env.status(1), JobStatus::Timeout);
        assert!(env.supervisor.stopped().is_empty());
        assert!(env.alarms.events().is_empty());
    }

    #[tokio::test]
    async fn stuck_timeouts_do_not_starve_cancel() {
        let env = TestEnv::new(|config| config.single_fetch_stop_job_rows = 10);
        for id in 1..=50 {
            job_with_executor(&env, id, JobStatus::Timeout);
        }
        job_with_executor(&env, 51, JobStatus::Canceling);
        env.supervisor.fail_stop("host is down");

        let daemon = StopDaemon::new(env.ctx.clone());
        for _ in 0..3 {
            daemon.tick().await;
        }

        assert_eq!(env.status(51), JobStatus::DoCanceling);
        assert_eq!(env.alarms.events(), vec![TASK_STOP_FAILED.to_string()]);
    }

    #[tokio::test]
    async fn destroyed_timeout_is_ignored() {
        let env = TestEnv::new(|_| {});
        let mut job = create_job(1, JobStatus::Timeout);
        job.executor_endpoint = Some(executor_endpoint(1));
        job.executor_destroyed_time = Some(job.create_time);
        env.insert_job(job);

        StopDaemon::new(env.ctx.clone()).tick().await;

        assert!(env.supervisor.stopped().is_empty());
    }
}
