use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use millstone::job::{Job, JobStatus, RunMode};
use millstone::messages::ProcessConfig;
use millstone::resource::ResourceLocation;

use crate::common::error::TaskmillError;
use crate::server::alarm::{TASK_LOGIC_ERROR, TASK_START_FAILED};
use crate::server::daemon::limiter::RateLimiter;
use crate::server::daemon::{Daemon, DaemonContext, millis};

const ENV_PROPERTY_PREFIX: &str = "env.";
const MEMORY_PARAMETER: &str = "memoryMb";

/// Requests resources for new jobs and starts executors once a supervisor is bound.
pub struct StartPreparingDaemon {
    ctx: Arc<DaemonContext>,
    limiter: RateLimiter,
}

impl StartPreparingDaemon {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        let limiter = RateLimiter::new(
            ctx.config.start_rate_per_second,
            ctx.config.start_rate_burst,
            ctx.clock.clone(),
        );
        Self { ctx, limiter }
    }

    fn prepare_jobs(&self) {
        let page = self.ctx.store.find(
            &[JobStatus::Preparing],
            0,
            self.ctx.config.single_start_preparing_job_rows,
        );
        for job in page.items {
            if let Err(error) = self.prepare(&job) {
                self.fail_job(&job, error);
            }
        }
    }

    fn prepare(&self, job: &Job) -> crate::Result<()> {
        let age = self.ctx.clock.elapsed_since(job.create_time);
        if age > self.ctx.config.preparing_expire() {
            if self.ctx.terminate_job(job, JobStatus::Timeout) {
                log::warn!(
                    "Job job_id={} expired after waiting {age:?} to be prepared",
                    job.id
                );
            }
            return Ok(());
        }
        if !self.limiter.try_acquire() {
            log::debug!("Start rate limit reached, job_id={} waits", job.id);
            return Ok(());
        }

        let job_context = self.ctx.job_context(job);
        self.ctx
            .allocator
            .submit_allocate_supervisor_endpoint_request(
                job.run_mode,
                &job_context,
                self.location_of(job),
            )?;
        let rows = self.ctx.store.update_status_by_id_old_status(
            job.id,
            JobStatus::Preparing,
            JobStatus::PreparingResr,
        );
        if rows == 0 {
            log::debug!("Job job_id={} changed while preparing, releasing", job.id);
            self.ctx.allocator.deallocate_supervisor_endpoint(job.id)?;
        }
        Ok(())
    }

    async fn start_prepared_jobs(&self) {
        let page = self.ctx.store.find(
            &[JobStatus::PreparingResr],
            0,
            self.ctx.config.single_start_preparing_job_rows,
        );
        for job in page.items {
            if let Err(error) = self.start(&job).await {
                self.fail_job(&job, error);
            }
        }
    }

    async fn start(&self, job: &Job) -> crate::Result<()> {
        if self.ctx.allocator.is_allocation_expired(job.id) {
            if self.ctx.terminate_job(job, JobStatus::Timeout) {
                log::warn!("Resource allocation of job_id={} expired", job.id);
            }
            return Ok(());
        }
        let job_context = self.ctx.job_context(job);
        let Some(supervisor) = self
            .ctx
            .allocator
            .check_allocate_supervisor_endpoint_state(&job_context)?
        else {
            return Ok(());
        };

        let executor = match self
            .ctx
            .supervisor_client
            .start_task(&supervisor, &job_context, &process_config(job))
            .await
        {
            Ok(executor) => executor,
            Err(error) => {
                self.ctx.allocator.deallocate_supervisor_endpoint(job.id)?;
                return Err(error);
            }
        };

        let rows = self.ctx.store.update_executor_info(
            job.id,
            &executor,
            JobStatus::PreparingResr,
            JobStatus::Running,
        );
        if rows > 0 {
            log::info!(
                "Job job_id={} started on {executor}, supervisor {supervisor}",
                job.id
            );
        } else {
            log::warn!(
                "Job job_id={} changed while its executor was starting, destroying {executor}",
                job.id
            );
            let result = self
                .ctx
                .supervisor_client
                .destroy_task(&supervisor, &executor, &job_context)
                .await;
            if let Some(error) = result.error {
                log::warn!("Destroying executor of job_id={} failed: {error}", job.id);
            }
        }
        Ok(())
    }

    fn fail_job(&self, job: &Job, error: TaskmillError) {
        log::error!("Starting job job_id={} failed: {error}", job.id);
        let event = match error {
            TaskmillError::LogicError(_) | TaskmillError::CoreError(_) => TASK_LOGIC_ERROR,
            _ => TASK_START_FAILED,
        };
        self.ctx.alarm_job(event, job, &error);
        self.ctx.terminate_job(job, JobStatus::Failed);
    }

    fn location_of(&self, job: &Job) -> ResourceLocation {
        match job.run_mode {
            RunMode::Process => ResourceLocation::local(),
            RunMode::K8s => {
                let (region, group) = match &self.ctx.config.k8s {
                    Some(k8s) => (k8s.region.as_str(), k8s.group.as_str()),
                    None => ("default", "default"),
                };
                ResourceLocation::new(
                    job.job_properties
                        .get("region")
                        .map(String::as_str)
                        .unwrap_or(region),
                    job.job_properties
                        .get("group")
                        .map(String::as_str)
                        .unwrap_or(group),
                )
            }
        }
    }
}

fn process_config(job: &Job) -> ProcessConfig {
    ProcessConfig {
        environments: job
            .job_properties
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PROPERTY_PREFIX)
                    .map(|name| (name.to_string(), value.clone()))
            })
            .collect(),
        memory_mb: job
            .job_parameters
            .get(MEMORY_PARAMETER)
            .and_then(|memory| memory.parse().ok()),
    }
}

#[async_trait]
impl Daemon for StartPreparingDaemon {
    fn name(&self) -> &'static str {
        "start-preparing"
    }

    fn interval(&self) -> Duration {
        millis(self.ctx.config.start_preparing_interval_ms)
    }

    async fn tick(&self) {
        self.prepare_jobs();
        self.start_prepared_jobs().await;
    }
}
