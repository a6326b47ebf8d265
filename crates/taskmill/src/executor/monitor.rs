use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use millstone::common::Map;
use millstone::common::retry::retry_until;
use millstone::endpoint::ExecutorEndpoint;
use millstone::job::RunMode;
use millstone::result::{HeartbeatRequest, TaskResult};

use crate::common::utils::time::parse_duration;
use crate::executor::reporter::ResultReporter;
use crate::executor::storage::{LOG_STORAGE_FAILED_REASON, LogStorage};
use crate::executor::task::BaseTask;

/// Job parameter limiting how long the task may run.
pub const EXECUTION_TIMEOUT_PARAMETER: &str = "executionTimeout";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub report_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long the executor stays up after the control plane collected its final result.
    pub linger: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            linger: Duration::from_secs(5),
        }
    }
}

/// Watches a running task: enforces its execution timeout, pushes results and heartbeats
/// to the control plane and performs the final report once the task ends.
pub struct TaskMonitor {
    task: Arc<BaseTask>,
    /// `None` when the control plane pulls results instead.
    reporter: Option<Arc<dyn ResultReporter>>,
    log_storage: Option<Arc<dyn LogStorage>>,
    run_mode: RunMode,
    log_dir: PathBuf,
    executor_endpoint: ExecutorEndpoint,
    settings: MonitorSettings,
    execution_timeout: Option<Duration>,

    log_metadata: Mutex<Map<String, String>>,
    log_meta_collected: watch::Sender<bool>,
    final_reported: AtomicBool,
    report_lock: tokio::sync::Mutex<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Arc<BaseTask>,
        reporter: Option<Arc<dyn ResultReporter>>,
        log_storage: Option<Arc<dyn LogStorage>>,
        run_mode: RunMode,
        log_dir: PathBuf,
        executor_endpoint: ExecutorEndpoint,
        settings: MonitorSettings,
    ) -> Arc<Self> {
        let execution_timeout = task
            .context()
            .job_parameters
            .get(EXECUTION_TIMEOUT_PARAMETER)
            .and_then(|value| match parse_duration(value) {
                Ok(timeout) => Some(timeout),
                Err(error) => {
                    log::warn!("Ignoring execution timeout of {}: {error}", task.context().trace);
                    None
                }
            });
        Arc::new(Self {
            task,
            reporter,
            log_storage,
            run_mode,
            log_dir,
            executor_endpoint,
            settings,
            execution_timeout,
            log_metadata: Default::default(),
            log_meta_collected: watch::Sender::new(false),
            final_reported: AtomicBool::new(false),
            report_lock: Default::default(),
            loops: Default::default(),
        })
    }

    pub fn task(&self) -> &Arc<BaseTask> {
        &self.task
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Starts the report loop and, when reporting is enabled, the heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(self.clone().report_loop()));
        if self.reporter.is_some() {
            loops.push(tokio::spawn(self.clone().heartbeat_loop()));
        }
    }

    async fn report_loop(self: Arc<Self>) {
        let started = Instant::now();
        let mut timed_out = false;
        let mut interval = tokio::time::interval(self.settings.report_interval);
        loop {
            interval.tick().await;
            if let Some(timeout) = self.execution_timeout {
                if !timed_out && !self.task.is_finished() && started.elapsed() >= timeout {
                    timed_out = true;
                    log::warn!(
                        "Task of {} exceeded its execution timeout of {timeout:?}, stopping it",
                        self.task.context().trace
                    );
                    self.task.stop().await;
                }
            }
            if let Some(reporter) = &self.reporter {
                self.report_progress(reporter.as_ref()).await;
            }
        }
    }

    async fn report_progress(&self, reporter: &dyn ResultReporter) {
        if self.task.status().is_terminated() || self.final_reported.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.report_lock.lock().await;
        if self.final_reported.load(Ordering::SeqCst) {
            return;
        }
        let result = self.current_result();
        if result.status.is_terminated() {
            return;
        }
        if !reporter.report_result(&result).await {
            log::debug!("Progress of {} was not reported", self.task.context().trace);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let Some(reporter) = self.reporter.clone() else {
            return;
        };
        let request = HeartbeatRequest {
            job_identity: self.task.context().job_identity,
            executor_endpoint: Some(self.executor_endpoint.clone()),
        };
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        loop {
            interval.tick().await;
            if !reporter.report_heartbeat(&request).await {
                log::warn!("Heartbeat of {} was not delivered", self.task.context().trace);
            }
        }
    }

    /// Current state of the task, including log locators once they are known.
    pub fn current_result(&self) -> TaskResult {
        let mut result = self.task.result(Some(self.executor_endpoint.clone()));
        result.error_message = self.task.error();
        result.log_metadata = self.log_metadata.lock().clone();
        result
    }

    /// Records that the control plane has pulled a result carrying log metadata.
    pub fn mark_log_meta_collected(&self) {
        self.log_meta_collected.send_replace(true);
    }

    async fn store_logs(&self) -> Map<String, String> {
        let job_id = self.task.context().job_id();
        let mut metadata = Map::default();
        match &self.log_storage {
            Some(storage) if self.run_mode.is_k8s() => {
                match storage.upload_log_files(job_id, &self.log_dir).await {
                    Ok(locators) => metadata = locators,
                    Err(error) => {
                        log::error!("Uploading logs of job_id={job_id} failed: {error}");
                        metadata.insert(LOG_STORAGE_FAILED_REASON.to_string(), error.to_string());
                    }
                }
            }
            _ => {
                metadata.insert(
                    LOG_STORAGE_FAILED_REASON.to_string(),
                    format!("log storage is not used in {} mode", self.run_mode),
                );
            }
        }
        if metadata.is_empty() {
            metadata.insert(
                LOG_STORAGE_FAILED_REASON.to_string(),
                "no log files were produced".to_string(),
            );
        }
        metadata
    }

    /// Finishes the monitoring of a task that has ended. Stores its logs and delivers the
    /// final result, either by pushing it or by waiting until the control plane pulls it.
    pub async fn final_work(&self) {
        let trace = &self.task.context().trace;
        let metadata = self.store_logs().await;
        *self.log_metadata.lock() = metadata;

        match &self.reporter {
            Some(reporter) => {
                let _guard = self.report_lock.lock().await;
                self.final_reported.store(true, Ordering::SeqCst);
                let result = self.current_result();
                log::info!("Reporting final result {:?} of {trace}", result.status);
                let reported = retry_until(
                    u32::MAX,
                    self.settings.report_interval,
                    |attempt| {
                        let reporter = reporter.clone();
                        let result = result.clone();
                        async move {
                            if attempt > 1 {
                                log::debug!("Final report attempt {attempt}");
                            }
                            reporter.report_result(&result).await
                        }
                    },
                    |accepted| *accepted,
                )
                .await;
                if reported.is_err() {
                    log::error!("Final result of {trace} could not be reported");
                }
            }
            None => {
                log::info!("Waiting until the control plane collects the result of {trace}");
                let mut collected = self.log_meta_collected.subscribe();
                let _ = collected.wait_for(|collected| *collected).await;
                tokio::time::sleep(self.settings.linger).await;
            }
        }

        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
    }
}
