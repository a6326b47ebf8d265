use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use millstone::context::JobContext;
use millstone::endpoint::ExecutorEndpoint;
use millstone::job::TaskStatus;
use millstone::result::TaskResult;

const MONITOR_INITIAL_DELAY: Duration = Duration::from_secs(1);
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Work of one job type.
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Runs the job to completion. An error fails the task.
    async fn do_start(&self, context: &JobContext) -> anyhow::Result<()>;

    /// Asks a running [`TaskBody::do_start`] to finish early.
    async fn do_stop(&self) -> anyhow::Result<()>;

    /// Progress in percent.
    fn progress(&self) -> f64;

    fn result_json(&self) -> Option<String>;

    fn on_update_progress(&self) {}

    fn on_finished(&self) {}

    fn on_failure(&self, _error: &anyhow::Error) {}
}

struct TaskState {
    status: TaskStatus,
    finished: bool,
    stopped: bool,
    error: Option<String>,
}

/// Lifecycle shared by all job types around a [`TaskBody`].
pub struct BaseTask {
    context: JobContext,
    body: Arc<dyn TaskBody>,
    state: Mutex<TaskState>,
    finished_notified: AtomicBool,
    monitor_interval: Duration,
}

impl BaseTask {
    pub fn new(context: JobContext, body: Arc<dyn TaskBody>) -> Arc<Self> {
        Self::with_monitor_interval(context, body, MONITOR_INTERVAL)
    }

    pub fn with_monitor_interval(
        context: JobContext,
        body: Arc<dyn TaskBody>,
        monitor_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            body,
            state: Mutex::new(TaskState {
                status: TaskStatus::Preparing,
                finished: false,
                stopped: false,
                error: None,
            }),
            finished_notified: AtomicBool::new(false),
            monitor_interval,
        })
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// Runs the task and returns its final status.
    pub async fn start(self: &Arc<Self>) -> TaskStatus {
        let job_id = self.context.job_id();
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Preparing {
                log::warn!("Task of job_id={job_id} was already started");
                return state.status;
            }
            state.status = TaskStatus::Running;
        }
        let monitor = tokio::spawn(self.clone().monitor_progress());

        log::info!("Task of job_id={job_id} ({}) started", self.context.job_type);
        let outcome = self.body.do_start(&self.context).await;

        let status = {
            let mut state = self.state.lock();
            state.status = match (&outcome, state.stopped) {
                (_, true) => TaskStatus::Canceled,
                (Ok(()), false) => TaskStatus::Done,
                (Err(error), false) => {
                    state.error = Some(format!("{error:#}"));
                    TaskStatus::Failed
                }
            };
            state.finished = true;
            state.status
        };
        if let Err(error) = &outcome {
            log::error!("Task of job_id={job_id} failed: {error:#}");
            self.body.on_failure(error);
        }
        self.notify_finished();
        monitor.abort();
        log::info!("Task of job_id={job_id} finished as {status:?}");
        status
    }

    async fn monitor_progress(self: Arc<Self>) {
        tokio::time::sleep(MONITOR_INITIAL_DELAY.min(self.monitor_interval)).await;
        let mut interval = tokio::time::interval(self.monitor_interval);
        loop {
            interval.tick().await;
            if self.is_finished() {
                self.notify_finished();
                break;
            }
            if self.is_stopped() {
                break;
            }
            self.body.on_update_progress();
        }
    }

    fn notify_finished(&self) {
        if !self.finished_notified.swap(true, Ordering::SeqCst) {
            self.body.on_finished();
        }
    }

    /// Cancels the task. Returns false if it has already finished.
    pub async fn stop(&self) -> bool {
        let job_id = self.context.job_id();
        {
            let mut state = self.state.lock();
            if state.finished {
                log::warn!("Task of job_id={job_id} already finished, it cannot be stopped");
                return false;
            }
            if state.stopped {
                return true;
            }
            state.stopped = true;
            state.status = TaskStatus::Canceled;
        }
        if let Err(error) = self.body.do_stop().await {
            log::warn!("Stopping task of job_id={job_id} failed: {error:#}");
        }
        log::info!("Task of job_id={job_id} canceled");
        true
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Snapshot of the task, without log metadata.
    pub fn result(&self, executor_endpoint: Option<ExecutorEndpoint>) -> TaskResult {
        let status = self.status();
        let mut result = TaskResult::new(self.context.job_identity.clone(), status);
        result.progress = if status == TaskStatus::Done {
            100.0
        } else {
            self.body.progress().clamp(0.0, 100.0)
        };
        result.result_json = self.body.result_json();
        result.executor_endpoint = executor_endpoint;
        result
    }
}
