//! HTTP endpoints of the control plane: executor reports and the job API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use millstone::job::{Job, JobStatus, RunMode};
use millstone::messages::{REPORT_HEARTBEAT_PATH, REPORT_RESULT_PATH, RpcResponse};
use millstone::result::{HeartbeatRequest, TaskResult};
use millstone::{JobId, Map, UserId};

use crate::common::error::TaskmillError;
use crate::server::daemon::DaemonContext;
use crate::server::event::JobEvent;
use crate::server::ingest::{IngestOutcome, ingest_task_result};

pub const JOBS_PATH: &str = "/api/v2/jobs";

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

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub job_type: String,
    pub run_mode: Option<RunMode>,
    #[serde(default)]
    pub job_parameters: Map<String, String>,
    #[serde(default)]
    pub job_properties: Map<String, String>,
    pub organization_id: Option<u64>,
    pub creator_id: Option<UserId>,
}

pub fn create_router(ctx: Arc<DaemonContext>) -> Router {
    Router::new()
        .route(REPORT_RESULT_PATH, post(report_result))
        .route(REPORT_HEARTBEAT_PATH, post(report_heartbeat))
        .route(JOBS_PATH, post(submit_job))
        .route("/api/v2/jobs/{job_id}", get(get_job))
        .route("/api/v2/jobs/{job_id}/cancel", post(cancel_job))
        .with_state(ctx)
}

/// Serves the API until `shutdown` flips.
pub async fn serve_api(
    ctx: Arc<DaemonContext>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> crate::Result<()> {
    log::info!("Control plane listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn find_job(ctx: &DaemonContext, job_id: JobId) -> crate::Result<Job> {
    ctx.store
        .get(job_id)
        .ok_or_else(|| TaskmillError::GenericError(format!("Job {job_id} not found")))
}

/// Returns false if the report was dropped.
fn accept_result(ctx: &DaemonContext, result: TaskResult) -> crate::Result<bool> {
    let job = find_job(ctx, result.job_identity.id)?;
    match job.status {
        JobStatus::Running | JobStatus::Canceling | JobStatus::DoCanceling => {}
        status if status.is_terminated() => {
            log::debug!("Dropping report of finished job job_id={} ({status})", job.id);
            return Ok(false);
        }
        status => {
            return Err(TaskmillError::JobError(format!(
                "Job {} is {status}, it cannot report results",
                job.id
            )));
        }
    }
    let outcome = ingest_task_result(ctx.store.as_ref(), &ctx.events, &job, result)?;
    Ok(outcome != IngestOutcome::Stale)
}

async fn report_result(
    State(ctx): State<Arc<DaemonContext>>,
    Json(result): Json<TaskResult>,
) -> ApiResponse<bool> {
    respond(accept_result(&ctx, result))
}

async fn report_heartbeat(
    State(ctx): State<Arc<DaemonContext>>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResponse<bool> {
    respond(find_job(&ctx, request.job_identity.id).map(|job| {
        !job.status.is_terminated()
            && ctx
                .store
                .update_heartbeat_with_expect_status(job.id, job.status)
                > 0
    }))
}

fn create_job(ctx: &DaemonContext, request: SubmitJobRequest) -> crate::Result<Job> {
    if request.job_type.trim().is_empty() {
        return Err(TaskmillError::GenericError("Job type is empty".to_string()));
    }
    let mut job = Job::new(
        ctx.store.next_job_id(),
        &request.job_type,
        request.run_mode.unwrap_or(ctx.config.run_mode),
        ctx.clock.now(),
    );
    job.job_parameters = request.job_parameters;
    job.job_properties = request.job_properties;
    job.organization_id = request.organization_id;
    job.creator_id = request.creator_id;
    ctx.store.insert(job.clone())?;
    log::info!("Job job_id={} ({}) submitted", job.id, job.job_type);
    Ok(job)
}

async fn submit_job(
    State(ctx): State<Arc<DaemonContext>>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResponse<Job> {
    respond(create_job(&ctx, request))
}

async fn get_job(
    State(ctx): State<Arc<DaemonContext>>,
    Path(job_id): Path<u64>,
) -> ApiResponse<Job> {
    respond(find_job(&ctx, JobId::new(job_id)))
}

fn request_cancel(ctx: &DaemonContext, job_id: JobId) -> crate::Result<JobStatus> {
    let job = find_job(ctx, job_id)?;
    let target = match job.status {
        JobStatus::Preparing | JobStatus::PreparingResr => JobStatus::Canceled,
        JobStatus::Running => JobStatus::Canceling,
        status => {
            return Err(TaskmillError::JobError(format!(
                "Job {job_id} is {status} and cannot be canceled"
            )));
        }
    };
    if ctx
        .store
        .update_status_by_id_old_status(job_id, job.status, target)
        == 0
    {
        return Err(TaskmillError::JobError(format!(
            "Job {job_id} changed while being canceled, try again"
        )));
    }
    if target.is_terminated() {
        ctx.events.publish(JobEvent::JobTerminate {
            job_id,
            status: target,
        });
    }
    log::info!("Job job_id={job_id} canceled, now {target}");
    Ok(target)
}

async fn cancel_job(
    State(ctx): State<Arc<DaemonContext>>,
    Path(job_id): Path<u64>,
) -> ApiResponse<JobStatus> {
    respond(request_cancel(&ctx, JobId::new(job_id)))
}
