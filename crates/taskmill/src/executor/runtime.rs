use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::common::config::ExecutorConfig;
use crate::common::error::TaskmillError;
use crate::executor::command::{COMMAND_JOB_TYPE, CommandTask};
use crate::executor::monitor::{MonitorSettings, TaskMonitor};
use crate::executor::reporter::{ResultReporter, TaskReporter};
use crate::executor::server::serve_executor;
use crate::executor::storage::{DirectoryLogStorage, LogStorage};
use crate::executor::task::{BaseTask, TaskBody};

/// Creates the body of a job of the given type.
pub fn create_task_body(job_type: &str, log_dir: &Path) -> crate::Result<Arc<dyn TaskBody>> {
    match job_type {
        COMMAND_JOB_TYPE => Ok(Arc::new(CommandTask::new(log_dir.to_path_buf()))),
        _ => Err(TaskmillError::JobError(format!(
            "Unknown job type `{job_type}`"
        ))),
    }
}

/// Runs a single job inside this process and returns once its final result was delivered.
pub async fn run_executor(config: ExecutorConfig) -> anyhow::Result<()> {
    let context = config.job_context.clone();
    log::info!(
        "Executor {} starting {} job of {}",
        config.executor_name,
        context.job_type,
        context.trace
    );

    let body = create_task_body(&context.job_type, &config.log_dir)?;
    let task = BaseTask::new(context.clone(), body);
    let reporter: Option<Arc<dyn ResultReporter>> = if config.report_enabled {
        Some(Arc::new(TaskReporter::new(context.host_urls.clone())?))
    } else {
        None
    };
    let log_storage: Option<Arc<dyn LogStorage>> = config
        .log_upload_dir
        .clone()
        .map(|dir| Arc::new(DirectoryLogStorage::new(dir)) as Arc<dyn LogStorage>);

    let listener = TcpListener::bind(("0.0.0.0", config.executor_port))
        .await
        .with_context(|| format!("Cannot listen on port {}", config.executor_port))?;
    let monitor = TaskMonitor::new(
        task.clone(),
        reporter,
        log_storage,
        config.run_mode,
        config.log_dir.clone(),
        config.endpoint(),
        MonitorSettings {
            report_interval: config.report_interval,
            heartbeat_interval: config.heartbeat_interval,
            ..Default::default()
        },
    );
    let server = tokio::spawn(serve_executor(monitor.clone(), listener));

    monitor.start();
    let status = task.start().await;
    log::info!("Task of {} ended as {status:?}", context.trace);
    monitor.final_work().await;

    server.abort();
    log::info!("Executor of {} is shutting down", context.trace);
    Ok(())
}
