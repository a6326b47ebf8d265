use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use millstone::context::JobContext;
use millstone::endpoint::{ExecutorEndpoint, SupervisorEndpoint};
use millstone::messages::{LogQuery, ProcessConfig, TaskCallerResult};
use millstone::resource::{POD_RESOURCE_TYPE, ResourceID, ResourceLocation, ResourceSpec};
use millstone::result::TaskResult;
use millstone::{JobId, Map, Set};

use crate::common::error::TaskmillError;
use crate::server::resource::k8s::{PodClient, PodInfo, PodTemplate};
use crate::server::resource::{DestroyOutcome, ResourceProbe, ResourceStrategy};
use crate::server::supervisor::client::{ExecutorClient, SupervisorClient};
use crate::tests::utils::executor_on;

#[derive(Default)]
struct ResourceState {
    allocated: Vec<ResourceID>,
    destroyed: Vec<ResourceID>,
    probe: Option<ResourceProbe>,
    busy: bool,
    destroy_error: Option<String>,
}

/// Pod-like resources that exist only in memory.
#[derive(Default)]
pub struct MockResourceStrategy {
    state: Mutex<ResourceState>,
}

impl MockResourceStrategy {
    pub fn resource_id(&self, name: &str) -> ResourceID {
        ResourceID::new(
            ResourceLocation::new("r", "g"),
            POD_RESOURCE_TYPE,
            "default",
            name,
        )
    }

    pub fn allocated(&self) -> Vec<ResourceID> {
        self.state.lock().allocated.clone()
    }

    pub fn destroyed(&self) -> Vec<ResourceID> {
        self.state.lock().destroyed.clone()
    }

    /// Probe returned for every resource, `Pending` by default.
    pub fn set_probe(&self, probe: ResourceProbe) {
        self.state.lock().probe = Some(probe);
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    pub fn fail_destroy(&self, error: &str) {
        self.state.lock().destroy_error = Some(error.to_string());
    }
}

#[async_trait]
impl ResourceStrategy for MockResourceStrategy {
    async fn allocate(
        &self,
        job_id: JobId,
        location: &ResourceLocation,
        spec: &ResourceSpec,
    ) -> crate::Result<ResourceID> {
        let name = if spec.name.is_empty() {
            format!("pod-{job_id}")
        } else {
            spec.name.clone()
        };
        let id = ResourceID::new(location.clone(), POD_RESOURCE_TYPE, "default", name);
        self.state.lock().allocated.push(id.clone());
        Ok(id)
    }

    async fn query(&self, _id: &ResourceID) -> crate::Result<ResourceProbe> {
        Ok(self
            .state
            .lock()
            .probe
            .clone()
            .unwrap_or(ResourceProbe::Pending))
    }

    async fn destroy(&self, id: &ResourceID) -> crate::Result<DestroyOutcome> {
        let mut state = self.state.lock();
        if let Some(error) = &state.destroy_error {
            return Err(TaskmillError::GenericError(error.clone()));
        }
        if state.busy {
            return Err(TaskmillError::ResourceBusy(id.clone()));
        }
        state.destroyed.push(id.clone());
        Ok(DestroyOutcome::Destroyed)
    }
}

#[derive(Default)]
struct PodState {
    pods: Map<String, PodInfo>,
    created: Vec<PodTemplate>,
    deleted: Vec<String>,
}

#[derive(Default)]
pub struct MockPodClient {
    state: Mutex<PodState>,
}

impl MockPodClient {
    pub fn created(&self) -> Vec<PodTemplate> {
        self.state.lock().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn set_pod(&self, name: &str, pod: PodInfo) {
        self.state.lock().pods.insert(name.to_string(), pod);
    }
}

#[async_trait]
impl PodClient for MockPodClient {
    async fn create_pod(&self, _namespace: &str, template: &PodTemplate) -> crate::Result<()> {
        let mut state = self.state.lock();
        state.pods.insert(
            template.name.clone(),
            PodInfo {
                phase: Some("Pending".to_string()),
                ..Default::default()
            },
        );
        state.created.push(template.clone());
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> crate::Result<Option<PodInfo>> {
        Ok(self.state.lock().pods.get(name).cloned())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> crate::Result<()> {
        let mut state = self.state.lock();
        state.pods.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }
}

type StartHook = Arc<dyn Fn(JobId) + Send + Sync>;

#[derive(Default)]
struct SupervisorState {
    dead: Set<SupervisorEndpoint>,
    started: Vec<JobId>,
    stopped: Vec<JobId>,
    destroyed: Vec<JobId>,
    start_error: Option<String>,
    stop_error: Option<String>,
    destroy_error: Option<String>,
    on_start: Option<StartHook>,
}

/// Supervisors that are alive unless marked dead, and start executors on their own host.
#[derive(Default)]
pub struct MockSupervisorClient {
    state: Mutex<SupervisorState>,
}

impl MockSupervisorClient {
    pub fn set_dead(&self, endpoint: &SupervisorEndpoint) {
        self.state.lock().dead.insert(endpoint.clone());
    }

    pub fn fail_start(&self, error: &str) {
        self.state.lock().start_error = Some(error.to_string());
    }

    pub fn fail_stop(&self, error: &str) {
        self.state.lock().stop_error = Some(error.to_string());
    }

    pub fn fail_destroy(&self, error: &str) {
        self.state.lock().destroy_error = Some(error.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.start_error = None;
        state.stop_error = None;
        state.destroy_error = None;
    }

    /// Runs `hook` inside every successful start, before the endpoint is returned.
    pub fn on_start(&self, hook: impl Fn(JobId) + Send + Sync + 'static) {
        self.state.lock().on_start = Some(Arc::new(hook));
    }

    pub fn started(&self) -> Vec<JobId> {
        self.state.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<JobId> {
        self.state.lock().stopped.clone()
    }

    pub fn destroyed(&self) -> Vec<JobId> {
        self.state.lock().destroyed.clone()
    }
}

fn caller_result(error: &Option<String>) -> TaskCallerResult {
    match error {
        Some(error) => TaskCallerResult::failed(error),
        None => TaskCallerResult::success(),
    }
}

#[async_trait]
impl SupervisorClient for MockSupervisorClient {
    async fn start_task(
        &self,
        supervisor: &SupervisorEndpoint,
        job_context: &JobContext,
        _process_config: &ProcessConfig,
    ) -> crate::Result<ExecutorEndpoint> {
        let job_id = job_context.job_id();
        let hook = {
            let mut state = self.state.lock();
            if let Some(error) = &state.start_error {
                return Err(TaskmillError::JobError(error.clone()));
            }
            state.started.push(job_id);
            state.on_start.clone()
        };
        if let Some(hook) = hook {
            hook(job_id);
        }
        Ok(executor_on(&supervisor.host, supervisor.port, job_id.as_num()))
    }

    async fn stop_task_directly(
        &self,
        _executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult {
        let mut state = self.state.lock();
        state.stopped.push(job_context.job_id());
        caller_result(&state.stop_error)
    }

    async fn destroy_task(
        &self,
        _supervisor: &SupervisorEndpoint,
        _executor: &ExecutorEndpoint,
        job_context: &JobContext,
    ) -> TaskCallerResult {
        let mut state = self.state.lock();
        if state.destroy_error.is_none() {
            state.destroyed.push(job_context.job_id());
        }
        caller_result(&state.destroy_error)
    }

    async fn is_supervisor_alive(&self, supervisor: &SupervisorEndpoint) -> bool {
        !self.state.lock().dead.contains(supervisor)
    }
}

/// Executors answering with preset results; jobs without one are unreachable.
#[derive(Default)]
pub struct MockExecutorClient {
    results: Mutex<Map<JobId, TaskResult>>,
}

impl MockExecutorClient {
    pub fn set_result(&self, result: TaskResult) {
        self.results
            .lock()
            .insert(result.job_identity.id, result);
    }
}

#[async_trait]
impl ExecutorClient for MockExecutorClient {
    async fn get_result(
        &self,
        executor: &ExecutorEndpoint,
        job_id: JobId,
    ) -> crate::Result<TaskResult> {
        self.results.lock().get(&job_id).cloned().ok_or_else(|| {
            TaskmillError::HttpError(format!("executor {executor} is unreachable"))
        })
    }

    async fn get_log(
        &self,
        _executor: &ExecutorEndpoint,
        _job_id: JobId,
        _query: &LogQuery,
    ) -> crate::Result<String> {
        Ok(String::new())
    }
}
