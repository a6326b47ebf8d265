use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use millstone::job::{Job, JobStatus};

use crate::server::alarm::{TASK_HEARTBEAT_TIMEOUT, TASK_LOGIC_ERROR};
use crate::server::daemon::{Daemon, DaemonContext, millis};
use crate::server::ingest::{IngestOutcome, ingest_task_result};

/// Pulls results from running executors and times out the silent ones.
pub struct PullResultDaemon {
    ctx: Arc<DaemonContext>,
    workers: Arc<Semaphore>,
}

impl PullResultDaemon {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        let workers = Arc::new(Semaphore::new(ctx.config.pull_result_workers.max(1)));
        Self { ctx, workers }
    }
}

/// Jobs that have been silent the longest come first.
pub(crate) fn sort_by_liveness(jobs: &mut [Job]) {
    jobs.sort_by_key(|job| job.liveness_reference_time());
}

async fn pull_job_result(ctx: Arc<DaemonContext>, job: Job) {
    let result = match &job.executor_endpoint {
        Some(endpoint) => ctx
            .executor_client
            .get_result(endpoint, job.id)
            .await
            .map_err(|error| error.to_string()),
        None => Err("job has no executor endpoint".to_string()),
    };
    match result {
        Ok(result) => match ingest_task_result(ctx.store.as_ref(), &ctx.events, &job, result) {
            Ok(IngestOutcome::Finalized(status)) => {
                log::debug!("Pulled final result of job_id={} ({status})", job.id)
            }
            Ok(IngestOutcome::Stale) => {
                log::debug!("Job job_id={} changed while its result was pulled", job.id)
            }
            Ok(IngestOutcome::Unchanged | IngestOutcome::Updated) => {}
            Err(error) => {
                log::error!("Applying result of job_id={} failed: {error}", job.id);
                ctx.alarm_job(TASK_LOGIC_ERROR, &job, &error);
            }
        },
        Err(error) => {
            log::debug!("Pulling result of job_id={} failed: {error}", job.id);
            check_heartbeat(&ctx, &job, &error);
        }
    }
}

fn check_heartbeat(ctx: &DaemonContext, job: &Job, error: &str) {
    let silence = ctx.clock.elapsed_since(job.liveness_reference_time());
    if silence <= ctx.config.job_heartbeat_timeout() {
        return;
    }
    if ctx.terminate_job(job, JobStatus::Timeout) {
        log::warn!(
            "Job job_id={} did not report for {silence:?}, timing out: {error}",
            job.id
        );
        ctx.alarm_job(
            TASK_HEARTBEAT_TIMEOUT,
            job,
            format!("no heartbeat for {silence:?}: {error}"),
        );
    }
}

#[async_trait]
impl Daemon for PullResultDaemon {
    fn name(&self) -> &'static str {
        "pull-result"
    }

    fn interval(&self) -> Duration {
        millis(self.ctx.config.pull_result_interval_ms)
    }

    async fn tick(&self) {
        let mut jobs = self
            .ctx
            .store
            .find_need_pull_result_jobs(0, self.ctx.config.single_pull_result_job_rows)
            .items;
        if jobs.is_empty() {
            return;
        }
        sort_by_liveness(&mut jobs);

        let mut set = JoinSet::new();
        for job in jobs {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                break;
            };
            let ctx = self.ctx.clone();
            set.spawn(async move {
                pull_job_result(ctx, job).await;
                drop(permit);
            });
        }

        let wait_check = self.ctx.config.pull_result_wait_check();
        loop {
            match tokio::time::timeout(wait_check, set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Err(error))) => log::error!("Pulling a job result panicked: {error}"),
                Ok(Some(Ok(()))) => {}
                Err(_) => log::warn!("Still pulling results of {} jobs", set.len()),
            }
        }
    }
}
