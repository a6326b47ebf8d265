//! Ownership of compute resources (local processes or cluster pods).
//!
//! Resource rows are created and removed only here. Strategies do the actual work,
//! one per [`RunMode`], selected from the resource type.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use millstone::common::clock::Clock;
use millstone::job::RunMode;
use millstone::resource::{
    POD_RESOURCE_TYPE, PROCESS_RESOURCE_TYPE, Resource, ResourceID, ResourceLocation,
    ResourceSpec, ResourceState,
};
use millstone::{JobId, Map};

use crate::common::error::TaskmillError;
use crate::server::store::JobStore;

pub mod k8s;
pub mod process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    /// The resource is not managed from this machine.
    Skipped,
}

/// Observed state of an allocated resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceProbe {
    Pending,
    Ready { endpoint: String },
    Failed(String),
    Missing,
}

#[async_trait]
pub trait ResourceStrategy: Send + Sync {
    async fn allocate(
        &self,
        job_id: JobId,
        location: &ResourceLocation,
        spec: &ResourceSpec,
    ) -> crate::Result<ResourceID>;

    async fn query(&self, id: &ResourceID) -> crate::Result<ResourceProbe>;

    /// Fails with [`TaskmillError::ResourceBusy`] while the resource is still alive.
    async fn destroy(&self, id: &ResourceID) -> crate::Result<DestroyOutcome>;
}

pub fn run_mode_of(id: &ResourceID) -> crate::Result<RunMode> {
    match id.resource_type.as_str() {
        PROCESS_RESOURCE_TYPE => Ok(RunMode::Process),
        POD_RESOURCE_TYPE => Ok(RunMode::K8s),
        other => Err(TaskmillError::GenericError(format!(
            "Unknown resource type `{other}` of {id}"
        ))),
    }
}

pub struct ResourceManager {
    strategies: Map<RunMode, Arc<dyn ResourceStrategy>>,
    resources: Mutex<Map<ResourceID, Resource>>,
    clock: Arc<dyn Clock>,
}

impl ResourceManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            strategies: Default::default(),
            resources: Default::default(),
            clock,
        }
    }

    pub fn with_strategy(mut self, run_mode: RunMode, strategy: Arc<dyn ResourceStrategy>) -> Self {
        self.strategies.insert(run_mode, strategy);
        self
    }

    fn strategy(&self, run_mode: RunMode) -> crate::Result<&Arc<dyn ResourceStrategy>> {
        self.strategies.get(&run_mode).ok_or_else(|| {
            TaskmillError::GenericError(format!("No resource strategy for run mode {run_mode}"))
        })
    }

    pub fn get(&self, id: &ResourceID) -> Option<Resource> {
        self.resources.lock().get(id).cloned()
    }

    /// Allocates a resource for `job_id`. A job that already owns a live resource
    /// gets that one back.
    pub async fn allocate(
        &self,
        run_mode: RunMode,
        job_id: JobId,
        location: &ResourceLocation,
        spec: &ResourceSpec,
    ) -> crate::Result<ResourceID> {
        let existing = self
            .resources
            .lock()
            .values()
            .find(|r| r.job_id == Some(job_id) && r.state != ResourceState::Destroying)
            .map(|r| r.id.clone());
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = self
            .strategy(run_mode)?
            .allocate(job_id, location, spec)
            .await?;
        log::info!("Allocated resource {id} for job_id={job_id}");
        self.resources.lock().insert(
            id.clone(),
            Resource {
                id: id.clone(),
                state: ResourceState::Creating,
                endpoint: None,
                job_id: Some(job_id),
                create_time: self.clock.now(),
            },
        );
        Ok(id)
    }

    /// Checks the resource and records its address once it becomes ready.
    pub async fn query(&self, id: &ResourceID) -> crate::Result<ResourceProbe> {
        let probe = self.strategy(run_mode_of(id)?)?.query(id).await?;
        if let ResourceProbe::Ready { endpoint } = &probe {
            if let Some(resource) = self.resources.lock().get_mut(id) {
                if resource.state == ResourceState::Creating {
                    resource.state = ResourceState::Available;
                }
                resource.endpoint = Some(endpoint.clone());
            }
        }
        Ok(probe)
    }

    pub async fn destroy(&self, id: &ResourceID) -> crate::Result<DestroyOutcome> {
        let outcome = self.strategy(run_mode_of(id)?)?.destroy(id).await?;
        if outcome == DestroyOutcome::Destroyed {
            self.resources.lock().remove(id);
            log::info!("Resource {id} destroyed");
        }
        Ok(outcome)
    }

    pub fn find_by_state(&self, state: ResourceState) -> Vec<ResourceID> {
        self.resources
            .lock()
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Marks a resource for asynchronous destruction by [`Self::process_pending_actions`].
    pub fn release(&self, id: &ResourceID) {
        let mut resources = self.resources.lock();
        match resources.get_mut(id) {
            Some(resource) => resource.state = ResourceState::Destroying,
            None => {
                resources.insert(
                    id.clone(),
                    Resource {
                        id: id.clone(),
                        state: ResourceState::Destroying,
                        endpoint: None,
                        job_id: None,
                        create_time: self.clock.now(),
                    },
                );
            }
        }
        log::debug!("Resource {id} released");
    }

    /// Destroys released resources. Busy resources stay queued for the next call.
    /// Returns the number of destroyed resources.
    pub async fn process_pending_actions(&self) -> usize {
        let pending = self.find_by_state(ResourceState::Destroying);
        let mut destroyed = 0;
        for id in pending {
            match self.destroy(&id).await {
                Ok(DestroyOutcome::Destroyed) => destroyed += 1,
                Ok(DestroyOutcome::Skipped) => {
                    log::debug!("Released resource {id} is not managed here, dropping it");
                    self.resources.lock().remove(&id);
                }
                Err(error) if error.is_resource_busy() => {
                    log::debug!("Released resource {id} is still busy");
                }
                Err(error) => log::warn!("Destroying released resource {id} failed: {error}"),
            }
        }
        destroyed
    }

    /// Resources whose owning job no longer needs them: the job is unknown, or it is
    /// terminal and its executor has already been destroyed.
    pub fn find_abandoned(&self, store: &dyn JobStore, limit: usize) -> Vec<ResourceID> {
        let owned: Vec<(ResourceID, Option<JobId>)> = self
            .resources
            .lock()
            .values()
            .filter(|r| r.state != ResourceState::Destroying)
            .map(|r| (r.id.clone(), r.job_id))
            .collect();
        owned
            .into_iter()
            .filter(|(_, job_id)| match job_id.and_then(|id| store.get(id)) {
                None => true,
                Some(job) => job.status.is_terminated() && job.executor_destroyed_time.is_some(),
            })
            .map(|(id, _)| id)
            .take(limit)
            .collect()
    }
}
