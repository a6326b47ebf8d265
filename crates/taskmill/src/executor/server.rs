//! HTTP server embedded in every executor.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;

use millstone::context::TraceContext;
use millstone::messages::{LogQuery, RpcResponse};
use millstone::result::TaskResult;

use crate::common::error::TaskmillError;
use crate::executor::command::job_log_dir;
use crate::executor::monitor::TaskMonitor;

type ApiResponse<T> = Json<RpcResponse<T>>;

fn respond<T>(result: crate::Result<T>) -> ApiResponse<T> {
    Json(match result {
        Ok(data) => RpcResponse::ok(data),
        Err(error) => {
            log::debug!("Request failed: {error}");
            RpcResponse::error(error.to_string())
        }
    })
}

pub fn create_router(monitor: Arc<TaskMonitor>) -> Router {
    Router::new()
        .route("/{job_id}/tasks/log", get(get_log))
        .route("/{job_id}/tasks/stop", post(stop_task))
        .route("/{job_id}/tasks/result", get(get_result))
        .with_state(monitor)
}

pub async fn serve_executor(monitor: Arc<TaskMonitor>, listener: TcpListener) -> crate::Result<()> {
    log::info!("Executor listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(monitor)).await?;
    Ok(())
}

fn check_job(monitor: &TaskMonitor, job_id: u64) -> crate::Result<()> {
    let own = monitor.task().context().job_id();
    if own.as_num() != job_id {
        return Err(TaskmillError::JobError(format!(
            "This executor runs job {own}, not job {job_id}"
        )));
    }
    Ok(())
}

/// Last `max_lines` lines of `content`, cut further to its last `max_bytes` bytes.
fn tail(content: &str, max_lines: Option<usize>, max_bytes: Option<usize>) -> &str {
    let mut start = 0;
    if let Some(max_lines) = max_lines {
        let trimmed = content.strip_suffix('\n').unwrap_or(content);
        start = if max_lines == 0 {
            content.len()
        } else {
            trimmed
                .rmatch_indices('\n')
                .nth(max_lines - 1)
                .map_or(0, |(index, _)| index + 1)
        };
    }
    if let Some(max_bytes) = max_bytes {
        let mut byte_start = content.len().saturating_sub(max_bytes).max(start);
        while !content.is_char_boundary(byte_start) {
            byte_start += 1;
        }
        start = byte_start;
    }
    &content[start..]
}

async fn get_log(
    State(monitor): State<Arc<TaskMonitor>>,
    Path(job_id): Path<u64>,
    Query(query): Query<LogQuery>,
) -> ApiResponse<String> {
    respond(read_log(&monitor, job_id, &query).await)
}

/// Upper bound on how much of a log file a single request reads.
const MAX_LOG_READ_BYTES: usize = 4 * 1024 * 1024;

async fn read_log(monitor: &TaskMonitor, job_id: u64, query: &LogQuery) -> crate::Result<String> {
    check_job(monitor, job_id)?;
    let path = job_log_dir(monitor.log_dir(), monitor.task().context().job_id())
        .join(query.log_type.file_name());
    let limit = query
        .fetch_max_byte_size
        .map_or(MAX_LOG_READ_BYTES, |bytes| bytes.min(MAX_LOG_READ_BYTES));
    let content = match read_tail(&path, limit).await {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(error) => return Err(error.into()),
    };
    let content = String::from_utf8_lossy(&content);
    Ok(tail(&content, query.fetch_max_line, query.fetch_max_byte_size).to_string())
}

/// Reads at most the last `limit` bytes of `path`, starting at a character boundary.
async fn read_tail(path: &std::path::Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(limit as u64);
    file.seek(SeekFrom::Start(start)).await?;
    let mut content = Vec::with_capacity((len - start) as usize);
    file.take(limit as u64).read_to_end(&mut content).await?;
    if start > 0 {
        // Drop a partially read UTF-8 sequence
        let skip = content
            .iter()
            .take_while(|byte| (**byte & 0b1100_0000) == 0b1000_0000)
            .count();
        content.drain(..skip);
    }
    Ok(content)
}

async fn stop_task(
    State(monitor): State<Arc<TaskMonitor>>,
    Path(job_id): Path<u64>,
    Json(trace): Json<TraceContext>,
) -> ApiResponse<bool> {
    respond(stop(&monitor, job_id, &trace).await)
}

async fn stop(monitor: &TaskMonitor, job_id: u64, trace: &TraceContext) -> crate::Result<bool> {
    check_job(monitor, job_id)?;
    log::info!("Stop of {trace} requested");
    Ok(monitor.task().stop().await)
}

async fn get_result(
    State(monitor): State<Arc<TaskMonitor>>,
    Path(job_id): Path<u64>,
) -> ApiResponse<TaskResult> {
    respond(check_job(&monitor, job_id).map(|_| {
        let result = monitor.current_result();
        if !result.log_metadata.is_empty() {
            monitor.mark_log_meta_collected();
        }
        result
    }))
}

#[cfg(test)]
mod tests {
    use super::{create_router, read_tail, tail};
    use crate::executor::monitor::{MonitorSettings, TaskMonitor};
    use crate::executor::task::BaseTask;
    use crate::executor::task::tests::GatedBody;
    use crate::server::supervisor::client::{ExecutorClient, HttpTaskClient, SupervisorClient};
    use crate::tests::utils::{JobBuilder, job_context};
    use millstone::JobId;
    use millstone::endpoint::ExecutorEndpoint;
    use millstone::job::{RunMode, TaskStatus};
    use millstone::messages::{LogQuery, LogType};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn tail_by_lines_and_bytes() {
        let content = "a\nbb\nccc\n";
        assert_eq!(tail(content, None, None), content);
        assert_eq!(tail(content, Some(2), None), "bb\nccc\n");
        assert_eq!(tail(content, Some(10), None), content);
        assert_eq!(tail(content, Some(0), None), "");
        assert_eq!(tail(content, None, Some(4)), "ccc\n");
        assert_eq!(tail(content, Some(2), Some(100)), "bb\nccc\n");
        assert_eq!(tail("žluť", None, Some(3)), "uť");
    }

    #[tokio::test]
    async fn reads_only_the_end_of_a_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("all.log");
        std::fs::write(&path, "one\nžluť\n").unwrap();

        assert_eq!(read_tail(&path, 7).await.unwrap(), "žluť\n".as_bytes());
        assert_eq!(read_tail(&path, 6).await.unwrap(), "luť\n".as_bytes());
        assert_eq!(read_tail(&path, 100).await.unwrap(), "one\nžluť\n".as_bytes());
        assert_eq!(
            read_tail(&dir.path().join("warn.log"), 10)
                .await
                .unwrap_err()
                .kind(),
            std::io::ErrorKind::NotFound
        );
    }

    struct Executor {
        monitor: Arc<TaskMonitor>,
        endpoint: ExecutorEndpoint,
        _dir: tempfile::TempDir,
    }

    async fn start_executor() -> Executor {
        let dir = tempfile::TempDir::new().unwrap();
        let job_dir = dir.path().join("9");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join("all.log"), "one\ntwo\nthree\n").unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = ExecutorEndpoint {
            protocol: "http".to_string(),
            host: "127.0.0.1".to_string(),
            supervisor_port: 1,
            executor_port: port,
            identifier: String::new(),
        };

        let body = Arc::new(GatedBody::default());
        let job = JobBuilder::default().id(9).build();
        let task = BaseTask::new(job_context(&job), body);
        let monitor = TaskMonitor::new(
            task,
            None,
            None,
            RunMode::Process,
            dir.path().to_path_buf(),
            endpoint.clone(),
            MonitorSettings {
                linger: Duration::ZERO,
                ..Default::default()
            },
        );
        let router = create_router(monitor.clone());
        tokio::spawn(async move { axum::serve(listener, router).await });
        Executor {
            monitor,
            endpoint,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn serves_log_tail() {
        let executor = start_executor().await;
        let client = HttpTaskClient::new().unwrap();
        let query = LogQuery {
            log_type: LogType::All,
            fetch_max_line: Some(2),
            fetch_max_byte_size: None,
        };
        let log = client
            .get_log(&executor.endpoint, JobId::new(9), &query)
            .await
            .unwrap();
        assert_eq!(log, "two\nthree\n");

        let query = LogQuery {
            log_type: LogType::Warn,
            fetch_max_line: None,
            fetch_max_byte_size: None,
        };
        let log = client
            .get_log(&executor.endpoint, JobId::new(9), &query)
            .await
            .unwrap();
        assert_eq!(log, "");
    }

    #[tokio::test]
    async fn wrong_job_is_rejected() {
        let executor = start_executor().await;
        let client = HttpTaskClient::new().unwrap();
        assert!(
            client
                .get_result(&executor.endpoint, JobId::new(10))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stop_and_collect_result() {
        let executor = start_executor().await;
        let client = HttpTaskClient::new().unwrap();
        let task = executor.monitor.task().clone();
        let runner = tokio::spawn({
            let task = task.clone();
            async move { task.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = client
            .get_result(&executor.endpoint, JobId::new(9))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Running);
        assert!(result.log_metadata.is_empty());

        let context = task.context().clone();
        let stopped = client
            .stop_task_directly(&executor.endpoint, &context)
            .await;
        assert!(stopped.succeed);
        assert_eq!(runner.await.unwrap(), TaskStatus::Canceled);

        // Pull mode: final work finishes only once the result with log metadata is collected
        let final_work = tokio::spawn({
            let monitor = executor.monitor.clone();
            async move { monitor.final_work().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!final_work.is_finished());

        let result = client
            .get_result(&executor.endpoint, JobId::new(9))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Canceled);
        assert!(!result.log_metadata.is_empty());
        tokio::time::timeout(Duration::from_secs(5), final_work)
            .await
            .unwrap()
            .unwrap();
    }
}
