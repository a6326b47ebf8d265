use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::SupervisorEndpoint;
use crate::ids::JobId;
use crate::job::RunMode;

pub const LOCAL_REGION: &str = "local";
pub const LOCAL_GROUP: &str = "local";

pub const PROCESS_RESOURCE_TYPE: &str = "process";
pub const POD_RESOURCE_TYPE: &str = "pod";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLocation {
    pub region: String,
    pub group: String,
}

impl ResourceLocation {
    pub fn new(region: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            group: group.into(),
        }
    }

    /// Sentinel location of process resources, which need no real allocation.
    pub fn local() -> Self {
        Self::new(LOCAL_REGION, LOCAL_GROUP)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceID {
    pub location: ResourceLocation,
    pub resource_type: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceID {
    pub fn new(
        location: ResourceLocation,
        resource_type: &str,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            location,
            resource_type: resource_type.to_string(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ResourceID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}/{}",
            self.location.region, self.location.group, self.resource_type, self.namespace, self.name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Creating,
    Available,
    /// Released by its owner, waiting to be destroyed.
    Destroying,
}

/// What a strategy needs to create a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// A compute unit owned by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceID,
    pub state: ResourceState,
    /// Reachable address once known (pod IP).
    pub endpoint: Option<String>,
    pub job_id: Option<JobId>,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceAllocateState {
    Allocating,
    Available,
    Failed,
}

/// Allocation request of one job, tracked from submission to deallocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocateInfo {
    pub job_id: JobId,
    pub run_mode: RunMode,
    pub location: ResourceLocation,
    pub supervisor_endpoint: Option<SupervisorEndpoint>,
    pub resource_allocate_state: ResourceAllocateState,
    /// Resource created exclusively for this allocation.
    pub resource_id: Option<ResourceID>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}
