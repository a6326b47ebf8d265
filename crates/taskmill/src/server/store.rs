use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use millstone::JobId;
use millstone::common::clock::Clock;
use millstone::endpoint::ExecutorEndpoint;
use millstone::job::{Job, JobStatus};
use millstone::result::TaskResult;

use crate::common::error::TaskmillError;

/// One page of a paged query, `total` counts all matching rows.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    fn slice(matching: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = matching.len();
        let items = matching.into_iter().skip(offset).take(limit).collect();
        Self { items, total }
    }
}

/// Persistence of job rows.
///
/// Every status change is a compare-and-swap against the status the caller last
/// observed; update methods return the number of affected rows (0 or 1) and a
/// stale caller simply affects nothing.
pub trait JobStore: Send + Sync {
    /// Inserts a new job, fails if a job with the same id exists.
    fn insert(&self, job: Job) -> crate::Result<()>;

    /// Reserves an id no inserted job uses.
    fn next_job_id(&self) -> JobId;

    fn get(&self, job_id: JobId) -> Option<Job>;

    fn find(&self, statuses: &[JobStatus], offset: usize, limit: usize) -> Page<Job>;

    /// Reads a row while holding its lock. The lock is released before this returns,
    /// remote calls are never made under it.
    fn find_with_pessimistic_lock(&self, job_id: JobId) -> crate::Result<Job>;

    fn update_status_by_id_old_status(&self, job_id: JobId, old: JobStatus, new: JobStatus)
    -> usize;

    fn update_heartbeat_with_expect_status(&self, job_id: JobId, expect: JobStatus) -> usize;

    /// Stores the result snapshot, progress and log metadata without touching status.
    fn update_result_snapshot(
        &self,
        job_id: JobId,
        result: &TaskResult,
        expect: JobStatus,
    ) -> crate::Result<usize>;

    /// Stores the final result and moves the job from `old` to `new`.
    fn update_task_result(
        &self,
        job_id: JobId,
        result: &TaskResult,
        old: JobStatus,
        new: JobStatus,
    ) -> crate::Result<usize>;

    /// Records the started executor and moves the job from `old` to `new`.
    fn update_executor_info(
        &self,
        job_id: JobId,
        endpoint: &ExecutorEndpoint,
        old: JobStatus,
        new: JobStatus,
    ) -> usize;

    fn update_executor_to_destroyed(&self, job_id: JobId) -> usize;

    /// Terminal jobs whose executor has not been destroyed yet.
    fn find_terminal_job(&self, offset: usize, limit: usize) -> Page<Job>;

    /// Canceling jobs, and timed out jobs that never got an executor. Timed out jobs with an
    /// executor belong to the finish daemon.
    fn find_need_stopped_jobs(&self, offset: usize, limit: usize) -> Page<Job>;

    /// Jobs whose executor is expected to report.
    fn find_need_pull_result_jobs(&self, offset: usize, limit: usize) -> Page<Job>;
}

/// Job store kept in memory, ordered by job id.
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    id_counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Default::default(),
            id_counter: AtomicU64::new(1),
            clock,
        }
    }

    fn filter(&self, offset: usize, limit: usize, predicate: impl Fn(&Job) -> bool) -> Page<Job> {
        let jobs = self.jobs.lock();
        let matching = jobs.values().filter(|j| predicate(j)).cloned().collect();
        Page::slice(matching, offset, limit)
    }

    fn update_if(
        &self,
        job_id: JobId,
        expect: JobStatus,
        update: impl FnOnce(&mut Job, &dyn Clock),
    ) -> usize {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == expect => {
                update(job, self.clock.as_ref());
                1
            }
            _ => 0,
        }
    }
}

fn set_status(job: &mut Job, status: JobStatus, clock: &dyn Clock) {
    job.status = status;
    if status.is_terminated() && job.finished_time.is_none() {
        job.finished_time = Some(clock.now());
    }
}

fn store_result(job: &mut Job, result: &TaskResult, json: String) {
    job.progress = result.progress;
    job.result_json = Some(json);
    if !result.log_metadata.is_empty() {
        job.log_metadata = result.log_metadata.clone();
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) -> crate::Result<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(TaskmillError::GenericError(format!(
                "Job {} already exists",
                job.id
            )));
        }
        self.id_counter
            .fetch_max(job.id.as_num() + 1, Ordering::SeqCst);
        jobs.insert(job.id, job);
        Ok(())
    }

    fn next_job_id(&self) -> JobId {
        JobId::new(self.id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs.lock().get(&job_id).cloned()
    }

    fn find(&self, statuses: &[JobStatus], offset: usize, limit: usize) -> Page<Job> {
        self.filter(offset, limit, |job| statuses.contains(&job.status))
    }

    fn find_with_pessimistic_lock(&self, job_id: JobId) -> crate::Result<Job> {
        self.get(job_id)
            .ok_or_else(|| TaskmillError::GenericError(format!("Job {job_id} not found")))
    }

    fn update_status_by_id_old_status(
        &self,
        job_id: JobId,
        old: JobStatus,
        new: JobStatus,
    ) -> usize {
        self.update_if(job_id, old, |job, clock| set_status(job, new, clock))
    }

    fn update_heartbeat_with_expect_status(&self, job_id: JobId, expect: JobStatus) -> usize {
        self.update_if(job_id, expect, |job, clock| {
            job.last_heartbeat_time = Some(clock.now())
        })
    }

    fn update_result_snapshot(
        &self,
        job_id: JobId,
        result: &TaskResult,
        expect: JobStatus,
    ) -> crate::Result<usize> {
        let json = serde_json::to_string(result)?;
        Ok(self.update_if(job_id, expect, |job, _| store_result(job, result, json)))
    }

    fn update_task_result(
        &self,
        job_id: JobId,
        result: &TaskResult,
        old: JobStatus,
        new: JobStatus,
    ) -> crate::Result<usize> {
        let json = serde_json::to_string(result)?;
        Ok(self.update_if(job_id, old, |job, clock| {
            store_result(job, result, json);
            set_status(job, new, clock);
        }))
    }

    fn update_executor_info(
        &self,
        job_id: JobId,
        endpoint: &ExecutorEndpoint,
        old: JobStatus,
        new: JobStatus,
    ) -> usize {
        self.update_if(job_id, old, |job, clock| {
            job.executor_identifier = Some(endpoint.identifier.clone());
            job.executor_endpoint = Some(endpoint.clone());
            set_status(job, new, clock);
        })
    }

    fn update_executor_to_destroyed(&self, job_id: JobId) -> usize {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&job_id) {
            Some(job) if job.executor_destroyed_time.is_none() => {
                job.executor_destroyed_time = Some(self.clock.now());
                1
            }
            _ => 0,
        }
    }

    fn find_terminal_job(&self, offset: usize, limit: usize) -> Page<Job> {
        self.filter(offset, limit, |job| {
            job.status.is_terminated() && job.executor_destroyed_time.is_none()
        })
    }

    fn find_need_stopped_jobs(&self, offset: usize, limit: usize) -> Page<Job> {
        self.filter(offset, limit, |job| match job.status {
            JobStatus::Canceling => true,
            JobStatus::Timeout => job.executor_endpoint.is_none(),
            _ => false,
        })
    }

    fn find_need_pull_result_jobs(&self, offset: usize, limit: usize) -> Page<Job> {
        self.find(&[JobStatus::Running, JobStatus::DoCanceling], offset, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::{JobStore, MemoryJobStore};
    use crate::tests::utils::{create_job, test_clock};
    use millstone::JobId;
    use millstone::job::{JobStatus, TaskStatus};
    use millstone::result::TaskResult;
    use std::sync::Arc;

    fn store() -> MemoryJobStore {
        MemoryJobStore::new(Arc::new(test_clock()))
    }

    #[test]
    fn stale_status_cas_is_noop() {
        let store = store();
        store.insert(create_job(1, JobStatus::Running)).unwrap();
        assert_eq!(
            store.update_status_by_id_old_status(JobId::new(1), JobStatus::Running, JobStatus::Done),
            1
        );
        assert_eq!(
            store.update_status_by_id_old_status(
                JobId::new(1),
                JobStatus::Running,
                JobStatus::Timeout
            ),
            0
        );
        let job = store.get(JobId::new(1)).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.finished_time.is_some());
    }

    #[test]
    fn cas_on_missing_job_affects_nothing() {
        let store = store();
        assert_eq!(
            store.update_status_by_id_old_status(JobId::new(9), JobStatus::Running, JobStatus::Done),
            0
        );
        assert_eq!(
            store.update_heartbeat_with_expect_status(JobId::new(9), JobStatus::Running),
            0
        );
    }

    #[test]
    fn duplicate_insert_fails() {
        let store = store();
        store.insert(create_job(1, JobStatus::Preparing)).unwrap();
        assert!(store.insert(create_job(1, JobStatus::Preparing)).is_err());
    }

    #[test]
    fn job_ids_skip_inserted_ones() {
        let store = store();
        assert_eq!(store.next_job_id(), JobId::new(1));
        store.insert(create_job(7, JobStatus::Preparing)).unwrap();
        assert_eq!(store.next_job_id(), JobId::new(8));
        assert_eq!(store.next_job_id(), JobId::new(9));
    }

    #[test]
    fn heartbeat_requires_expected_status() {
        let store = store();
        store.insert(create_job(1, JobStatus::Running)).unwrap();
        assert_eq!(
            store.update_heartbeat_with_expect_status(JobId::new(1), JobStatus::DoCanceling),
            0
        );
        assert!(store.get(JobId::new(1)).unwrap().last_heartbeat_time.is_none());
        assert_eq!(
            store.update_heartbeat_with_expect_status(JobId::new(1), JobStatus::Running),
            1
        );
        assert!(store.get(JobId::new(1)).unwrap().last_heartbeat_time.is_some());
    }

    #[test]
    fn task_result_is_stored_with_status() {
        let store = store();
        let job = create_job(1, JobStatus::Running);
        let mut result = TaskResult::new(job.identity(), TaskStatus::Done);
        result.progress = 100.0;
        result
            .log_metadata
            .insert("ALL".to_string(), "file:///tmp/all.log".to_string());
        store.insert(job).unwrap();

        let rows = store
            .update_task_result(JobId::new(1), &result, JobStatus::Running, JobStatus::Done)
            .unwrap();
        assert_eq!(rows, 1);
        let job = store.get(JobId::new(1)).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.previous_result(), Some(result));
        assert_eq!(job.log_metadata.len(), 1);
    }

    #[test]
    fn paged_queries() {
        let store = store();
        for id in 1..=5 {
            store.insert(create_job(id, JobStatus::Running)).unwrap();
        }
        store.insert(create_job(6, JobStatus::Canceling)).unwrap();
        store.insert(create_job(7, JobStatus::Timeout)).unwrap();
        store.insert(create_job(8, JobStatus::Done)).unwrap();
        store.update_executor_to_destroyed(JobId::new(8));

        let page = store.find_need_pull_result_jobs(2, 2);
        assert_eq!(page.total, 5);
        assert_eq!(
            page.items.iter().map(|j| j.id.as_num()).collect::<Vec<_>>(),
            vec![3, 4]
        );

        let stop: Vec<_> = store
            .find_need_stopped_jobs(0, 10)
            .items
            .iter()
            .map(|j| j.id.as_num())
            .collect();
        assert_eq!(stop, vec![6, 7]);

        let terminal: Vec<_> = store
            .find_terminal_job(0, 10)
            .items
            .iter()
            .map(|j| j.id.as_num())
            .collect();
        assert_eq!(terminal, vec![7]);
    }

    #[test]
    fn executor_destroyed_only_once() {
        let store = store();
        store.insert(create_job(1, JobStatus::Failed)).unwrap();
        assert_eq!(store.update_executor_to_destroyed(JobId::new(1)), 1);
        assert_eq!(store.update_executor_to_destroyed(JobId::new(1)), 0);
    }
}
