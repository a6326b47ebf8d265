//! HTTP endpoints of a supervisor agent.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use millstone::common::clock::SystemClock;
use millstone::endpoint::ExecutorEndpoint;
use millstone::messages::{
    DestroyTaskRequest, RpcResponse, SUPERVISOR_DESTROY_PATH, SUPERVISOR_HEARTBEAT_PATH,
    SUPERVISOR_START_PATH, StartTaskRequest,
};

use crate::common::config::SupervisorConfig;
use crate::supervisor::launcher::ExecutorLauncher;

type ApiResponse<T> = Json<RpcResponse<T>>;

fn respond<T>(result: crate::Result<T>) -> ApiResponse<T> {
    Json(match result {
        Ok(data) => RpcResponse::ok(data),
        Err(error) => {
            log::warn!("Supervisor request failed: {error}");
            RpcResponse::error(error.to_string())
        }
    })
}

pub fn create_router(launcher: Arc<ExecutorLauncher>) -> Router {
    Router::new()
        .route(SUPERVISOR_START_PATH, post(start_task))
        .route(SUPERVISOR_DESTROY_PATH, post(destroy_task))
        .route(SUPERVISOR_HEARTBEAT_PATH, get(heartbeat))
        .with_state(launcher)
}

async fn start_task(
    State(launcher): State<Arc<ExecutorLauncher>>,
    Json(request): Json<StartTaskRequest>,
) -> ApiResponse<ExecutorEndpoint> {
    log::info!("Start of {} requested", request.job_context.trace);
    respond(launcher.start(&request.job_context, &request.process_config))
}

async fn destroy_task(
    State(launcher): State<Arc<ExecutorLauncher>>,
    Json(request): Json<DestroyTaskRequest>,
) -> ApiResponse<bool> {
    log::info!("Destroy of {} requested", request.job_context.trace);
    respond(
        launcher
            .destroy(&request.executor_endpoint)
            .await
            .map(|_| true),
    )
}

async fn heartbeat() -> ApiResponse<bool> {
    Json(RpcResponse::ok(true))
}

/// Runs the supervisor agent until SIGINT.
pub async fn run_supervisor(config: SupervisorConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("Cannot listen on port {}", config.listen_port))?;
    log::info!(
        "Supervisor {} listening on {}, executors log into {}",
        config.hostname,
        listener.local_addr()?,
        config.log_dir.display()
    );
    let launcher = Arc::new(ExecutorLauncher::new(config, Arc::new(SystemClock)));
    axum::serve(listener, create_router(launcher))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received SIGINT, stopping supervisor");
            }
        })
        .await?;
    Ok(())
}
