use std::fs::File;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Command;

use millstone::common::clock::Clock;
use millstone::context::JobContext;
use millstone::endpoint::{DEFAULT_PROTOCOL, ExecutorEndpoint, ExecutorIdentifier, executor_name};
use millstone::messages::ProcessConfig;
use millstone::{JobId, Map};

use crate::common::config::{
    ENV_EXECUTOR_HOST, ENV_EXECUTOR_NAME, ENV_EXECUTOR_PORT, ENV_JOB_CONTEXT, ENV_LOG_DIR,
    ENV_LOG_UPLOAD_DIR, ENV_REPORT_ENABLED, ENV_RUN_MODE, ENV_SUPERVISOR_PORT, SupervisorConfig,
};
use crate::common::error::TaskmillError;
use crate::common::utils::network::find_free_port;
use crate::executor::command::job_log_dir;
use crate::server::resource::process::ProcessResourceStrategy;
use crate::server::resource::{DestroyOutcome, ResourceStrategy};

pub const EXECUTOR_NAME_PREFIX: &str = "task-";
const EXECUTOR_LOG_FILE: &str = "executor.log";

/// Starts executor processes on this machine and kills them on request.
pub struct ExecutorLauncher {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    processes: Arc<Mutex<Map<JobId, ExecutorEndpoint>>>,
    killer: ProcessResourceStrategy,
}

impl ExecutorLauncher {
    pub fn new(config: SupervisorConfig, clock: Arc<dyn Clock>) -> Self {
        let killer = ProcessResourceStrategy::new(config.hostname.clone());
        Self {
            config,
            clock,
            processes: Default::default(),
            killer,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Executor of the job started by this launcher, if it is still running.
    pub fn running_executor(&self, job_id: JobId) -> Option<ExecutorEndpoint> {
        self.processes.lock().get(&job_id).cloned()
    }

    fn create_command(
        &self,
        job_context: &JobContext,
        process_config: &ProcessConfig,
        executor_port: u16,
        name: &str,
    ) -> crate::Result<Command> {
        let config = &self.config;
        let log_dir = job_log_dir(&config.log_dir, job_context.job_id());
        std::fs::create_dir_all(&log_dir)?;
        let log_file = File::create(log_dir.join(EXECUTOR_LOG_FILE))?;

        let mut command = Command::new(&config.executor_program);
        command
            .arg("executor")
            .envs(process_config.environments.iter())
            .env(ENV_JOB_CONTEXT, serde_json::to_string(job_context)?)
            .env(ENV_EXECUTOR_PORT, executor_port.to_string())
            .env(ENV_SUPERVISOR_PORT, config.listen_port.to_string())
            .env(ENV_RUN_MODE, config.run_mode.to_string())
            .env(ENV_REPORT_ENABLED, config.report_enabled.to_string())
            .env(ENV_LOG_DIR, &config.log_dir)
            .env(ENV_EXECUTOR_HOST, &config.hostname)
            .env(ENV_EXECUTOR_NAME, name)
            .stdin(Stdio::null())
            .stdout(log_file.try_clone()?)
            .stderr(log_file);
        if let Some(upload_dir) = &config.log_upload_dir {
            command.env(ENV_LOG_UPLOAD_DIR, upload_dir);
        }

        let memory_limit = process_config.memory_mb.map(|mb| mb * 1024 * 1024);
        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(move || {
                // Own process group, so that the whole executor tree can be signalled
                if let Err(error) = nix::unistd::setsid() {
                    log::error!("Cannot set SID for executor process: {error:?}");
                }
                if let Some(bytes) = memory_limit {
                    let bytes = bytes as nix::libc::rlim_t;
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        bytes,
                        bytes,
                    )?;
                }
                Ok(())
            });
        }
        Ok(command)
    }

    /// Starts an executor for the job, or returns the one already running.
    pub fn start(
        &self,
        job_context: &JobContext,
        process_config: &ProcessConfig,
    ) -> crate::Result<ExecutorEndpoint> {
        let job_id = job_context.job_id();
        if let Some(endpoint) = self.running_executor(job_id) {
            log::info!("Executor of {} is already running", job_context.trace);
            return Ok(endpoint);
        }

        let executor_port = find_free_port()?;
        let name = executor_name(EXECUTOR_NAME_PREFIX, job_id, self.clock.now());
        let mut child = self
            .create_command(job_context, process_config, executor_port, &name)?
            .spawn()
            .map_err(|error| {
                TaskmillError::GenericError(format!(
                    "Cannot start executor {}: {error}",
                    self.config.executor_program.display()
                ))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| TaskmillError::GenericError("Executor exited immediately".into()))?;

        let host = self.config.hostname.clone();
        let endpoint = ExecutorEndpoint {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: host.clone(),
            supervisor_port: self.config.listen_port,
            executor_port,
            identifier: ExecutorIdentifier::new(host, Some(executor_port), pid.to_string(), name)
                .to_string(),
        };
        self.processes.lock().insert(job_id, endpoint.clone());
        log::info!(
            "Executor of {} started with pid {pid} on port {executor_port}",
            job_context.trace
        );

        let processes = self.processes.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::info!("Executor of job_id={job_id} (pid {pid}) exited with {status}"),
                Err(error) => log::error!("Waiting for executor of job_id={job_id} failed: {error}"),
            }
            processes.lock().remove(&job_id);
        });
        Ok(endpoint)
    }

    /// Kills the executor process. Returns an error while the process is still alive.
    pub async fn destroy(&self, executor: &ExecutorEndpoint) -> crate::Result<()> {
        let identifier = ExecutorIdentifier::parse(&executor.identifier)?;
        let resource = ProcessResourceStrategy::resource_id_of(&identifier).ok_or_else(|| {
            TaskmillError::JobError(format!(
                "Executor {} is not a local process",
                executor.identifier
            ))
        })?;
        match self.killer.destroy(&resource).await? {
            DestroyOutcome::Destroyed => Ok(()),
            DestroyOutcome::Skipped => Err(TaskmillError::JobError(format!(
                "Executor {} does not run on {}",
                executor.identifier, self.config.hostname
            ))),
        }
    }
}
