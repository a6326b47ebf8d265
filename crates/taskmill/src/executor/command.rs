use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::watch;

use millstone::context::JobContext;
use millstone::ids::JobId;
use millstone::messages::LogType;

use crate::executor::task::TaskBody;

pub const COMMAND_JOB_TYPE: &str = "command";
pub const COMMAND_PARAMETER: &str = "command";

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Directory with the log files of a job.
pub fn job_log_dir(log_dir: &Path, job_id: JobId) -> PathBuf {
    log_dir.join(job_id.to_string())
}

/// Runs the `command` job parameter through `sh -c`, with stdout written to the
/// `ALL` log and stderr to the `WARN` log.
pub struct CommandTask {
    log_dir: PathBuf,
    stop: watch::Sender<bool>,
    exit_code: Mutex<Option<i32>>,
}

impl CommandTask {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            stop: watch::Sender::new(false),
            exit_code: Mutex::new(None),
        }
    }

    fn create_command(&self, context: &JobContext) -> anyhow::Result<Command> {
        let script = context
            .job_parameters
            .get(COMMAND_PARAMETER)
            .ok_or_else(|| anyhow!("Job parameter `{COMMAND_PARAMETER}` is missing"))?;

        let work_dir = job_log_dir(&self.log_dir, context.job_id());
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("Cannot create directory {}", work_dir.display()))?;
        let log_file = |log_type: LogType| -> anyhow::Result<Stdio> {
            let path = work_dir.join(log_type.file_name());
            let file = File::create(&path)
                .with_context(|| format!("Cannot create log file {}", path.display()))?;
            Ok(Stdio::from(file))
        };

        let mut command = Command::new("sh");
        command.arg("-c").arg(script);

        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                // Own process group, so that stop signals do not reach the executor
                if let Err(error) = nix::unistd::setsid() {
                    log::error!("Cannot set SID for command process: {error:?}");
                }
                Ok(())
            });
        }

        command
            .kill_on_drop(true)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(log_file(LogType::All)?)
            .stderr(log_file(LogType::Warn)?);
        Ok(command)
    }
}

fn send_signal(pid: u32, signal: Signal) -> anyhow::Result<()> {
    let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid as i32)))
        .map_err(|error| anyhow!("Cannot get PGID for PID {pid}: {error:?}"))?;
    signal::killpg(pgid, Some(signal))
        .map_err(|error| anyhow!("Cannot send signal {signal} to PGID {pgid}: {error:?}"))
}

#[async_trait]
impl TaskBody for CommandTask {
    async fn do_start(&self, context: &JobContext) -> anyhow::Result<()> {
        let job_id = context.job_id();
        let mut child = self.create_command(context)?.spawn()?;
        let pid = child.id().ok_or_else(|| anyhow!("Command exited before it started"))?;
        log::debug!("Command of job_id={job_id} started with pid {pid}");

        let mut stop_receiver = self.stop.subscribe();
        let wait = child.wait();
        tokio::pin!(wait);
        let status = tokio::select! {
            status = &mut wait => status?,
            _ = async { let _ = stop_receiver.wait_for(|stopped| *stopped).await; } => {
                log::debug!("Stopping command of job_id={job_id} with SIGINT");
                if let Err(error) = send_signal(pid, Signal::SIGINT) {
                    log::warn!("{error:#}");
                }
                match tokio::time::timeout(STOP_GRACE_PERIOD, &mut wait).await {
                    Ok(status) => status?,
                    Err(_) => {
                        if let Err(error) = send_signal(pid, Signal::SIGKILL) {
                            log::error!("Unable to kill command of job_id={job_id}: {error:#}");
                        }
                        wait.await?
                    }
                }
            }
        };

        *self.exit_code.lock() = status.code();
        if !status.success() && !*self.stop.borrow() {
            bail!("Command exited with {status}");
        }
        Ok(())
    }

    async fn do_stop(&self) -> anyhow::Result<()> {
        self.stop.send_replace(true);
        Ok(())
    }

    fn progress(&self) -> f64 {
        match *self.exit_code.lock() {
            Some(0) => 100.0,
            _ => 0.0,
        }
    }

    fn result_json(&self) -> Option<String> {
        self.exit_code
            .lock()
            .map(|code| serde_json::json!({ "exitCode": code }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandTask, job_log_dir};
    use crate::executor::task::BaseTask;
    use crate::tests::utils::{JobBuilder, job_context};
    use millstone::ids::JobId;
    use millstone::job::TaskStatus;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn command_task(dir: &std::path::Path, script: &str) -> Arc<BaseTask> {
        let job = JobBuilder::default()
            .id(7)
            .parameter("command", script)
            .build();
        BaseTask::new(
            job_context(&job),
            Arc::new(CommandTask::new(dir.to_path_buf())),
        )
    }

    #[tokio::test]
    async fn output_goes_to_log_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let task = command_task(dir.path(), "echo hello; echo oops 1>&2");
        assert_eq!(task.start().await, TaskStatus::Done);

        let logs = job_log_dir(dir.path(), JobId::new(7));
        assert_eq!(
            std::fs::read_to_string(logs.join("all.log")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            std::fs::read_to_string(logs.join("warn.log")).unwrap(),
            "oops\n"
        );
        assert_eq!(
            task.result(None).result_json.as_deref(),
            Some(r#"{"exitCode":0}"#)
        );
    }

    #[tokio::test]
    async fn non_zero_exit_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let task = command_task(dir.path(), "exit 3");
        assert_eq!(task.start().await, TaskStatus::Failed);
        assert_eq!(
            task.result(None).result_json.as_deref(),
            Some(r#"{"exitCode":3}"#)
        );
        assert!(task.error().is_some());
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let job = JobBuilder::default().id(8).build();
        let task = BaseTask::new(
            job_context(&job),
            Arc::new(CommandTask::new(dir.path().to_path_buf())),
        );
        assert_eq!(task.start().await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn stop_interrupts_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let task = command_task(dir.path(), "sleep 30");
        let runner = tokio::spawn({
            let task = task.clone();
            async move { task.start().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        assert!(task.stop().await);
        assert_eq!(runner.await.unwrap(), TaskStatus::Canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
