use millstone::fsm::next_status;
use millstone::job::{Job, JobStatus, TaskStatus};
use millstone::result::TaskResult;

use crate::server::event::{EventBus, JobEvent};
use crate::server::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Nothing the control plane tracks has changed.
    Unchanged,
    /// The snapshot was stored.
    Updated,
    /// The job reached a terminal status.
    Finalized(JobStatus),
    /// The job moved on since it was read, nothing was applied.
    Stale,
}

/// Applies a result pulled from, or pushed by, the executor of `job`.
///
/// The heartbeat is refreshed whenever the executor was reached. A result carrying log
/// metadata finalizes the job through the status FSM and is applied even if it equals the
/// stored snapshot, so a finalization that lost its CAS is retried by the next pull or
/// push. Any other result is stored only if it changed.
pub fn ingest_task_result(
    store: &dyn JobStore,
    events: &EventBus,
    job: &Job,
    result: TaskResult,
) -> crate::Result<IngestOutcome> {
    store.update_heartbeat_with_expect_status(job.id, job.status);

    if result.status == TaskStatus::Preparing {
        return Ok(IngestOutcome::Unchanged);
    }
    let previous = job.previous_result();
    let changed = result.progress_changed(previous.as_ref());
    let finishing = !result.log_metadata.is_empty() && !job.status.is_terminated();
    if !changed && !finishing {
        return Ok(IngestOutcome::Unchanged);
    }
    if changed {
        events.publish(JobEvent::TaskResult {
            job_id: job.id,
            job_type: job.job_type.clone(),
            result: result.clone(),
        });
    }

    if finishing {
        let next = next_status(job.status, result.status)?;
        if next.is_terminated() {
            return finalize(store, events, job, &result, next);
        }
        log::debug!(
            "Job job_id={} sent log metadata while still {:?}",
            job.id,
            result.status
        );
        if !changed {
            return Ok(IngestOutcome::Unchanged);
        }
    }
    if store.update_result_snapshot(job.id, &result, job.status)? == 0 {
        return Ok(IngestOutcome::Stale);
    }
    Ok(IngestOutcome::Updated)
}

fn finalize(
    store: &dyn JobStore,
    events: &EventBus,
    job: &Job,
    result: &TaskResult,
    next: JobStatus,
) -> crate::Result<IngestOutcome> {
    if store.update_task_result(job.id, result, job.status, next)? == 0 {
        log::warn!(
            "Job job_id={} left status {} before it could become {next}",
            job.id,
            job.status
        );
        return Ok(IngestOutcome::Stale);
    }
    log::info!("Job job_id={} finished as {next}", job.id);
    events.publish(JobEvent::JobTerminate {
        job_id: job.id,
        status: next,
    });
    Ok(IngestOutcome::Finalized(next))
}
