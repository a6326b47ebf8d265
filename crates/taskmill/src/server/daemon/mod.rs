//! Periodic reconciliation loops of the control plane.
//!
//! Every daemon runs as an independent task on its own fixed period. A tick is
//! never started before the previous tick of the same daemon has finished, and
//! daemons never wait for each other: they coordinate only through
//! compare-and-swap status updates in the job store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use millstone::common::clock::Clock;
use millstone::context::JobContext;
use millstone::job::{Job, JobStatus};

use crate::common::config::TaskFrameworkConfig;
use crate::server::alarm::{AlarmSink, job_alarm};
use crate::server::event::{EventBus, JobEvent};
use crate::server::resource::ResourceManager;
use crate::server::store::JobStore;
use crate::server::supervisor::allocator::SupervisorAgentAllocator;
use crate::server::supervisor::client::{ExecutorClient, SupervisorClient};

pub mod finish;
pub mod limiter;
pub mod manage_resource;
pub mod pull_result;
pub mod start_preparing;
pub mod stop;

/// Dependencies shared by all daemons.
pub struct DaemonContext {
    pub config: Arc<TaskFrameworkConfig>,
    pub store: Arc<dyn JobStore>,
    pub allocator: Arc<SupervisorAgentAllocator>,
    pub resource_manager: Arc<ResourceManager>,
    pub supervisor_client: Arc<dyn SupervisorClient>,
    pub executor_client: Arc<dyn ExecutorClient>,
    pub alarm: Arc<dyn AlarmSink>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

impl DaemonContext {
    pub fn job_context(&self, job: &Job) -> JobContext {
        JobContext::from_job(job, self.config.server_urls.clone())
    }

    /// Moves `job` from its observed status to a terminal one, announcing the
    /// change if this caller won the update. Returns true if it did.
    pub fn terminate_job(&self, job: &Job, status: JobStatus) -> bool {
        let rows = self
            .store
            .update_status_by_id_old_status(job.id, job.status, status);
        if rows > 0 {
            self.events.publish(JobEvent::JobTerminate {
                job_id: job.id,
                status,
            });
            true
        } else {
            log::debug!(
                "Job job_id={} left status {} before it could become {status}",
                job.id,
                job.status
            );
            false
        }
    }

    pub fn alarm_job(&self, event_name: &str, job: &Job, message: impl ToString) {
        self.alarm.alarm(event_name, job_alarm(job.id, message));
    }
}

#[async_trait]
pub trait Daemon: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Processes one batch. Errors are handled per job inside the tick.
    async fn tick(&self);
}

pub async fn run_daemon(daemon: Arc<dyn Daemon>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(daemon.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!(
        "Daemon {} started, interval {:?}",
        daemon.name(),
        daemon.interval()
    );
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let start = Instant::now();
                daemon.tick().await;
                log::trace!("Daemon {} tick took {:?}", daemon.name(), start.elapsed());
            }
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Daemon {} stopped", daemon.name());
}

pub fn create_daemons(ctx: &Arc<DaemonContext>) -> Vec<Arc<dyn Daemon>> {
    vec![
        Arc::new(start_preparing::StartPreparingDaemon::new(ctx.clone())),
        Arc::new(pull_result::PullResultDaemon::new(ctx.clone())),
        Arc::new(stop::StopDaemon::new(ctx.clone())),
        Arc::new(finish::FinishDaemon::new(ctx.clone())),
        Arc::new(manage_resource::ManageResourceDaemon::new(ctx.clone())),
    ]
}

pub fn spawn_daemons(
    ctx: &Arc<DaemonContext>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    create_daemons(ctx)
        .into_iter()
        .map(|daemon| tokio::spawn(run_daemon(daemon, shutdown.clone())))
        .collect()
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value.max(1))
}
