use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use millstone::common::clock::Clock;
use millstone::context::JobContext;
use millstone::endpoint::SupervisorEndpoint;
use millstone::job::RunMode;
use millstone::resource::{
    ResourceAllocateInfo, ResourceAllocateState, ResourceID, ResourceLocation, ResourceSpec,
};
use millstone::{JobId, Map};

use crate::common::config::TaskFrameworkConfig;
use crate::common::error::TaskmillError;
use crate::server::resource::{ResourceManager, ResourceProbe};
use crate::server::supervisor::client::SupervisorClient;

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// ALLOCATING requests older than this fail.
    pub allocate_timeout: Duration,
    /// Control port of supervisors running in dedicated pods.
    pub pod_supervisor_port: u16,
    pub pod_spec: ResourceSpec,
    pub pod_name_prefix: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            allocate_timeout: Duration::from_secs(300),
            pod_supervisor_port: 9000,
            pod_spec: ResourceSpec::default(),
            pod_name_prefix: "taskmill-supervisor-".to_string(),
        }
    }
}

impl From<&TaskFrameworkConfig> for AllocatorConfig {
    fn from(config: &TaskFrameworkConfig) -> Self {
        let mut allocator = AllocatorConfig {
            allocate_timeout: config.resource_allocate_timeout(),
            ..Default::default()
        };
        if let Some(k8s) = &config.k8s {
            allocator.pod_supervisor_port = k8s.supervisor_port;
            allocator.pod_spec.cpu = k8s.cpu.clone();
            allocator.pod_spec.memory = k8s.memory.clone();
        }
        allocator
    }
}

/// Binds jobs to supervisor agents.
///
/// Requests are recorded as ALLOCATING and resolved asynchronously by
/// [`SupervisorAgentAllocator::process_pending_allocations`]: a registered
/// supervisor with the lowest load that answers a liveness check is chosen,
/// and in K8S mode a dedicated supervisor pod is created when none is available.
pub struct SupervisorAgentAllocator {
    infos: Mutex<Map<JobId, ResourceAllocateInfo>>,
    /// Registered supervisors and the number of jobs bound to each.
    endpoints: Mutex<BTreeMap<SupervisorEndpoint, usize>>,
    supervisor_client: Arc<dyn SupervisorClient>,
    resource_manager: Arc<ResourceManager>,
    clock: Arc<dyn Clock>,
    config: AllocatorConfig,
}

impl SupervisorAgentAllocator {
    pub fn new(
        supervisor_client: Arc<dyn SupervisorClient>,
        resource_manager: Arc<ResourceManager>,
        clock: Arc<dyn Clock>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            infos: Default::default(),
            endpoints: Default::default(),
            supervisor_client,
            resource_manager,
            clock,
            config,
        }
    }

    pub fn register_endpoint(&self, endpoint: SupervisorEndpoint) {
        log::info!("Registering supervisor {endpoint}");
        self.endpoints.lock().entry(endpoint).or_insert(0);
    }

    pub fn endpoint_load(&self, endpoint: &SupervisorEndpoint) -> Option<usize> {
        self.endpoints.lock().get(endpoint).copied()
    }

    pub fn query_allocate_info(&self, job_id: JobId) -> Option<ResourceAllocateInfo> {
        self.infos.lock().get(&job_id).cloned()
    }

    /// Records an allocation request. Repeated requests of one job are ignored.
    pub fn submit_allocate_supervisor_endpoint_request(
        &self,
        run_mode: RunMode,
        job_context: &JobContext,
        location: ResourceLocation,
    ) -> crate::Result<()> {
        let job_id = job_context.job_id();
        let now = self.clock.now();
        let mut infos = self.infos.lock();
        if infos.contains_key(&job_id) {
            log::debug!("Allocation of {} already requested", job_context.trace);
            return Ok(());
        }
        infos.insert(
            job_id,
            ResourceAllocateInfo {
                job_id,
                run_mode,
                location,
                supervisor_endpoint: None,
                resource_allocate_state: ResourceAllocateState::Allocating,
                resource_id: None,
                create_time: now,
                update_time: now,
            },
        );
        log::debug!("Allocation of {} requested", job_context.trace);
        Ok(())
    }

    /// Returns the bound supervisor, `None` while the request is still pending.
    pub fn check_allocate_supervisor_endpoint_state(
        &self,
        job_context: &JobContext,
    ) -> crate::Result<Option<SupervisorEndpoint>> {
        let job_id = job_context.job_id();
        let infos = self.infos.lock();
        let info = infos.get(&job_id).ok_or_else(|| {
            TaskmillError::GenericError(format!("No allocation request of job {job_id}"))
        })?;
        match info.resource_allocate_state {
            ResourceAllocateState::Allocating => Ok(None),
            ResourceAllocateState::Available => match &info.supervisor_endpoint {
                Some(endpoint) => Ok(Some(endpoint.clone())),
                None => Err(TaskmillError::LogicError(format!(
                    "Allocation of job {job_id} is available without an endpoint"
                ))),
            },
            ResourceAllocateState::Failed => Err(TaskmillError::AllocationFailed(job_id)),
        }
    }

    pub fn is_allocation_expired(&self, job_id: JobId) -> bool {
        self.infos.lock().get(&job_id).is_some_and(|info| {
            info.resource_allocate_state == ResourceAllocateState::Allocating
                && self.clock.elapsed_since(info.create_time) > self.config.allocate_timeout
        })
    }

    /// Releases everything reserved for the job. Calling it again is a no-op.
    pub fn deallocate_supervisor_endpoint(&self, job_id: JobId) -> crate::Result<()> {
        let Some(info) = self.infos.lock().remove(&job_id) else {
            return Ok(());
        };
        if info.resource_allocate_state == ResourceAllocateState::Available {
            if let Some(endpoint) = &info.supervisor_endpoint {
                if let Some(load) = self.endpoints.lock().get_mut(endpoint) {
                    *load = load.saturating_sub(1);
                }
            }
        }
        if let Some(resource_id) = &info.resource_id {
            self.resource_manager.release(resource_id);
        }
        log::debug!("Allocation of job_id={job_id} released");
        Ok(())
    }

    /// Resolves pending requests.
    pub async fn process_pending_allocations(&self) {
        let pending: Vec<ResourceAllocateInfo> = self
            .infos
            .lock()
            .values()
            .filter(|info| info.resource_allocate_state == ResourceAllocateState::Allocating)
            .cloned()
            .collect();
        for info in pending {
            let job_id = info.job_id;
            if self.clock.elapsed_since(info.create_time) > self.config.allocate_timeout {
                log::warn!("Allocation of job_id={job_id} timed out");
                self.fail(job_id);
                continue;
            }
            if let Some(resource_id) = &info.resource_id {
                self.poll_dedicated_resource(job_id, resource_id).await;
                continue;
            }
            if let Some(endpoint) = self.choose_endpoint().await {
                self.bind(job_id, endpoint, true);
                continue;
            }
            if info.run_mode.is_k8s() {
                self.create_dedicated_resource(&info).await;
            } else {
                log::debug!("No supervisor available for job_id={job_id}, waiting");
            }
        }
    }

    async fn choose_endpoint(&self) -> Option<SupervisorEndpoint> {
        let mut candidates: Vec<(SupervisorEndpoint, usize)> = self
            .endpoints
            .lock()
            .iter()
            .map(|(endpoint, load)| (endpoint.clone(), *load))
            .collect();
        candidates.sort_by_key(|(_, load)| *load);
        for (endpoint, _) in candidates {
            if self.supervisor_client.is_supervisor_alive(&endpoint).await {
                return Some(endpoint);
            }
            log::debug!("Supervisor {endpoint} is not alive, skipping");
        }
        None
    }

    async fn create_dedicated_resource(&self, info: &ResourceAllocateInfo) {
        let job_id = info.job_id;
        let spec = ResourceSpec {
            name: millstone::endpoint::executor_name(
                &self.config.pod_name_prefix,
                job_id,
                self.clock.now(),
            ),
            ..self.config.pod_spec.clone()
        };
        match self
            .resource_manager
            .allocate(info.run_mode, job_id, &info.location, &spec)
            .await
        {
            Ok(resource_id) => {
                let mut infos = self.infos.lock();
                match infos.get_mut(&job_id) {
                    Some(info) => {
                        info.resource_id = Some(resource_id);
                        info.update_time = self.clock.now();
                    }
                    // Deallocated in the meantime
                    None => self.resource_manager.release(&resource_id),
                }
            }
            Err(error) => {
                log::warn!("Creating supervisor resource for job_id={job_id} failed: {error}")
            }
        }
    }

    async fn poll_dedicated_resource(&self, job_id: JobId, resource_id: &ResourceID) {
        match self.resource_manager.query(resource_id).await {
            Ok(ResourceProbe::Ready { endpoint }) => {
                let endpoint = SupervisorEndpoint::new(endpoint, self.config.pod_supervisor_port);
                if self.supervisor_client.is_supervisor_alive(&endpoint).await {
                    self.bind(job_id, endpoint, false);
                }
            }
            Ok(ResourceProbe::Pending) => {}
            Ok(ResourceProbe::Failed(reason)) => {
                log::warn!("Supervisor resource {resource_id} of job_id={job_id} failed: {reason}");
                self.fail(job_id);
            }
            Ok(ResourceProbe::Missing) => {
                log::warn!("Supervisor resource {resource_id} of job_id={job_id} disappeared");
                self.fail(job_id);
            }
            Err(error) => log::warn!("Querying resource {resource_id} failed: {error}"),
        }
    }

    fn bind(&self, job_id: JobId, endpoint: SupervisorEndpoint, pooled: bool) {
        let mut infos = self.infos.lock();
        let Some(info) = infos.get_mut(&job_id) else {
            return;
        };
        if info.resource_allocate_state != ResourceAllocateState::Allocating {
            return;
        }
        if pooled {
            if let Some(load) = self.endpoints.lock().get_mut(&endpoint) {
                *load += 1;
            }
        }
        log::info!("Job job_id={job_id} bound to supervisor {endpoint}");
        info.supervisor_endpoint = Some(endpoint);
        info.resource_allocate_state = ResourceAllocateState::Available;
        info.update_time = self.clock.now();
    }

    fn fail(&self, job_id: JobId) {
        if let Some(info) = self.infos.lock().get_mut(&job_id) {
            info.resource_allocate_state = ResourceAllocateState::Failed;
            info.update_time = self.clock.now();
        }
    }
}
