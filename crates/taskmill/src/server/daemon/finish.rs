use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use millstone::endpoint::ExecutorIdentifier;
use millstone::job::{Job, RunMode};
use millstone::resource::{POD_RESOURCE_TYPE, ResourceAllocateInfo, ResourceID, ResourceLocation};

use crate::common::error::TaskmillError;
use crate::server::alarm::TASK_EXECUTOR_DESTROY_FAILED;
use crate::server::daemon::{Daemon, DaemonContext, millis};
use crate::server::resource::DestroyOutcome;
use crate::server::resource::process::ProcessResourceStrategy;

/// How the executor of a finished job has to be torn down.
#[derive(Debug)]
enum ExecutorTeardown {
    /// Started through a supervisor agent.
    Agent(ResourceAllocateInfo),
    /// Executor pod known only from its identifier.
    LegacyPod(ResourceID),
    /// Executor process known only from its identifier.
    LegacyProcess(ResourceID),
    /// No executor was ever started.
    NotStarted,
}

/// Destroys executors of terminal jobs and marks them as destroyed.
pub struct FinishDaemon {
    ctx: Arc<DaemonContext>,
}

impl FinishDaemon {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    fn teardown_of(&self, job: &Job) -> crate::Result<ExecutorTeardown> {
        if let Some(info) = self.ctx.allocator.query_allocate_info(job.id) {
            return Ok(ExecutorTeardown::Agent(info));
        }
        let Some(identifier) = &job.executor_identifier else {
            return Ok(ExecutorTeardown::NotStarted);
        };
        let identifier = ExecutorIdentifier::parse(identifier)?;
        match job.run_mode {
            RunMode::K8s => {
                let location = match &self.ctx.config.k8s {
                    Some(k8s) => ResourceLocation::new(k8s.region.clone(), k8s.group.clone()),
                    None => ResourceLocation::local(),
                };
                Ok(ExecutorTeardown::LegacyPod(ResourceID::new(
                    location,
                    POD_RESOURCE_TYPE,
                    identifier.namespace,
                    identifier.executor_name,
                )))
            }
            RunMode::Process => ProcessResourceStrategy::resource_id_of(&identifier)
                .map(ExecutorTeardown::LegacyProcess)
                .ok_or_else(|| {
                    TaskmillError::GenericError(format!(
                        "Executor identifier {identifier} carries no process id"
                    ))
                }),
        }
    }

    /// Returns true once nothing of the executor is left.
    async fn destroy_executor(&self, job: &Job) -> crate::Result<bool> {
        match self.teardown_of(job)? {
            ExecutorTeardown::Agent(info) => {
                if let (Some(supervisor), Some(executor)) =
                    (&info.supervisor_endpoint, &job.executor_endpoint)
                {
                    let result = self
                        .ctx
                        .supervisor_client
                        .destroy_task(supervisor, executor, &self.ctx.job_context(job))
                        .await;
                    if let Some(error) = result.error {
                        return Err(TaskmillError::JobError(format!(
                            "Supervisor {supervisor} cannot destroy executor {executor}: {error}"
                        )));
                    }
                }
                self.ctx.allocator.deallocate_supervisor_endpoint(job.id)?;
                Ok(true)
            }
            ExecutorTeardown::LegacyPod(resource_id) => {
                self.ctx.resource_manager.release(&resource_id);
                Ok(true)
            }
            ExecutorTeardown::LegacyProcess(resource_id) => {
                let outcome = self.ctx.resource_manager.destroy(&resource_id).await?;
                Ok(outcome == DestroyOutcome::Destroyed)
            }
            ExecutorTeardown::NotStarted => Ok(true),
        }
    }

    async fn finish_job(&self, job: &Job) -> crate::Result<()> {
        let job = self.ctx.store.find_with_pessimistic_lock(job.id)?;
        if !job.status.is_terminated() || job.executor_destroyed_time.is_some() {
            return Ok(());
        }
        if self.destroy_executor(&job).await?
            && self.ctx.store.update_executor_to_destroyed(job.id) > 0
        {
            log::info!("Executor of job job_id={} ({}) destroyed", job.id, job.status);
        }
        Ok(())
    }
}

#[async_trait]
impl Daemon for FinishDaemon {
    fn name(&self) -> &'static str {
        "finish"
    }

    fn interval(&self) -> Duration {
        millis(self.ctx.config.finish_interval_ms)
    }

    async fn tick(&self) {
        let page = self
            .ctx
            .store
            .find_terminal_job(0, self.ctx.config.single_fetch_destroy_executor_job_rows);
        for job in page.items {
            match self.finish_job(&job).await {
                Ok(()) => {}
                Err(error) if error.is_resource_busy() => {
                    log::debug!("Executor of job_id={} is still shutting down", job.id);
                }
                Err(error) => {
                    log::warn!("Destroying executor of job_id={} failed: {error}", job.id);
                    self.ctx
                        .alarm_job(TASK_EXECUTOR_DESTROY_FAILED, &job, &error);
                }
            }
        }
    }
}
