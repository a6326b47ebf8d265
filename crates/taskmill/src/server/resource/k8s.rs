use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{DeleteParams, PostParams};
use tokio::sync::OnceCell;

use millstone::JobId;
use millstone::resource::{POD_RESOURCE_TYPE, ResourceID, ResourceLocation, ResourceSpec};

use crate::common::config::K8sConfig;
use crate::common::error::TaskmillError;
use crate::server::resource::{DestroyOutcome, ResourceProbe, ResourceStrategy};

const POD_LABEL: &str = "taskmill/job-id";

/// Pod to be created for a supervisor agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    pub name: String,
    pub job_id: JobId,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
    pub terminating: bool,
}

/// Minimal pod operations used by the pod strategy.
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn create_pod(&self, namespace: &str, template: &PodTemplate) -> crate::Result<()>;
    async fn get_pod(&self, namespace: &str, name: &str) -> crate::Result<Option<PodInfo>>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> crate::Result<()>;
}

/// [`PodClient`] talking to the cluster from the ambient kube configuration.
#[derive(Default)]
pub struct KubePodClient {
    client: OnceCell<kube::Client>,
}

impl KubePodClient {
    async fn pods(&self, namespace: &str) -> crate::Result<Api<Pod>> {
        let client = self
            .client
            .get_or_try_init(|| async { kube::Client::try_default().await })
            .await?;
        Ok(Api::namespaced(client.clone(), namespace))
    }
}

fn build_pod(template: &PodTemplate) -> Pod {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &template.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &template.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(template.name.clone()),
            labels: Some(BTreeMap::from([(
                POD_LABEL.to_string(),
                template.job_id.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "supervisor".to_string(),
                image: Some(template.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                args: Some(template.args.clone()),
                env: Some(
                    template
                        .env
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: Some(value.clone()),
                            value_from: None,
                        })
                        .collect(),
                ),
                resources: (!limits.is_empty()).then(|| ResourceRequirements {
                    limits: Some(limits.clone()),
                    requests: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn create_pod(&self, namespace: &str, template: &PodTemplate) -> crate::Result<()> {
        self.pods(namespace)
            .await?
            .create(&PostParams::default(), &build_pod(template))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> crate::Result<Option<PodInfo>> {
        let pod = self.pods(namespace).await?.get_opt(name).await?;
        Ok(pod.map(|pod| PodInfo {
            phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
            pod_ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
            terminating: pod.metadata.deletion_timestamp.is_some(),
        }))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> crate::Result<()> {
        match self
            .pods(namespace)
            .await?
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Supervisor agents running in dedicated pods.
pub struct K8sResourceStrategy {
    pods: Arc<dyn PodClient>,
    config: K8sConfig,
}

impl K8sResourceStrategy {
    pub fn new(pods: Arc<dyn PodClient>, config: K8sConfig) -> Self {
        Self { pods, config }
    }
}

#[async_trait]
impl ResourceStrategy for K8sResourceStrategy {
    async fn allocate(
        &self,
        job_id: JobId,
        location: &ResourceLocation,
        spec: &ResourceSpec,
    ) -> crate::Result<ResourceID> {
        let template = PodTemplate {
            name: spec.name.clone(),
            job_id,
            image: self.config.image.clone(),
            args: vec![
                "supervisor".to_string(),
                "--port".to_string(),
                self.config.supervisor_port.to_string(),
                "--run-mode".to_string(),
                "k8s".to_string(),
            ],
            env: vec![("RUST_LOG".to_string(), "info".to_string())],
            cpu: spec.cpu.clone().or_else(|| self.config.cpu.clone()),
            memory: spec.memory.clone().or_else(|| self.config.memory.clone()),
        };
        self.pods
            .create_pod(&self.config.namespace, &template)
            .await
            .map_err(|e| {
                TaskmillError::KubeError(format!("Cannot create pod {}: {e}", template.name))
            })?;
        Ok(ResourceID::new(
            location.clone(),
            POD_RESOURCE_TYPE,
            self.config.namespace.clone(),
            template.name,
        ))
    }

    async fn query(&self, id: &ResourceID) -> crate::Result<ResourceProbe> {
        let Some(pod) = self.pods.get_pod(&id.namespace, &id.name).await? else {
            return Ok(ResourceProbe::Missing);
        };
        Ok(match (pod.phase.as_deref(), pod.pod_ip) {
            (Some("Failed"), _) => ResourceProbe::Failed(format!("Pod {} failed", id.name)),
            (Some("Succeeded"), _) => {
                ResourceProbe::Failed(format!("Pod {} exited", id.name))
            }
            (Some("Running"), Some(ip)) => ResourceProbe::Ready { endpoint: ip },
            _ => ResourceProbe::Pending,
        })
    }

    async fn destroy(&self, id: &ResourceID) -> crate::Result<DestroyOutcome> {
        match self.pods.get_pod(&id.namespace, &id.name).await? {
            None => Ok(DestroyOutcome::Destroyed),
            Some(pod) if pod.terminating => Err(TaskmillError::ResourceBusy(id.clone())),
            Some(_) => {
                self.pods.delete_pod(&id.namespace, &id.name).await?;
                Err(TaskmillError::ResourceBusy(id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{K8sResourceStrategy, PodInfo, build_pod};
    use crate::common::config::K8sConfig;
    use crate::server::resource::{DestroyOutcome, ResourceProbe, ResourceStrategy};
    use crate::tests::utils::MockPodClient;
    use millstone::JobId;
    use millstone::resource::{ResourceLocation, ResourceSpec};
    use std::sync::Arc;

    fn strategy(pods: Arc<MockPodClient>) -> K8sResourceStrategy {
        let config = K8sConfig {
            namespace: "jobs".to_string(),
            cpu: Some("2".to_string()),
            ..Default::default()
        };
        K8sResourceStrategy::new(pods, config)
    }

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn allocate_creates_pod() {
        let pods = Arc::new(MockPodClient::default());
        let strategy = strategy(pods.clone());
        let id = strategy
            .allocate(JobId::new(4), &ResourceLocation::new("r", "g"), &spec("sup-4"))
            .await
            .unwrap();
        assert_eq!(id.namespace, "jobs");
        assert_eq!(id.name, "sup-4");
        let created = pods.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].cpu.as_deref(), Some("2"));
        assert_eq!(created[0].args[0], "supervisor");
    }

    #[tokio::test]
    async fn query_follows_pod_phase() {
        let pods = Arc::new(MockPodClient::default());
        let strategy = strategy(pods.clone());
        let id = strategy
            .allocate(JobId::new(4), &ResourceLocation::new("r", "g"), &spec("sup-4"))
            .await
            .unwrap();
        assert_eq!(strategy.query(&id).await.unwrap(), ResourceProbe::Pending);

        pods.set_pod(
            "sup-4",
            PodInfo {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.2.0.8".to_string()),
                terminating: false,
            },
        );
        assert_eq!(
            strategy.query(&id).await.unwrap(),
            ResourceProbe::Ready {
                endpoint: "10.2.0.8".to_string()
            }
        );

        pods.set_pod(
            "sup-4",
            PodInfo {
                phase: Some("Failed".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(
            strategy.query(&id).await.unwrap(),
            ResourceProbe::Failed(_)
        ));
    }

    #[tokio::test]
    async fn destroy_waits_until_pod_is_gone() {
        let pods = Arc::new(MockPodClient::default());
        let strategy = strategy(pods.clone());
        let id = strategy
            .allocate(JobId::new(4), &ResourceLocation::new("r", "g"), &spec("sup-4"))
            .await
            .unwrap();

        assert!(strategy.destroy(&id).await.unwrap_err().is_resource_busy());
        assert_eq!(pods.deleted(), vec!["sup-4".to_string()]);
        assert_eq!(
            strategy.destroy(&id).await.unwrap(),
            DestroyOutcome::Destroyed
        );
    }

    #[test]
    fn pod_manifest() {
        let template = super::PodTemplate {
            name: "sup-1".to_string(),
            job_id: JobId::new(1),
            image: "taskmill:1".to_string(),
            args: vec!["supervisor".to_string()],
            env: vec![("A".to_string(), "B".to_string())],
            cpu: None,
            memory: Some("1Gi".to_string()),
        };
        let pod = build_pod(&template);
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("taskmill:1"));
        let limits = container
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits["memory"].0, "1Gi");
        assert_eq!(
            pod.metadata.labels.unwrap()["taskmill/job-id"],
            "1".to_string()
        );
    }
}
