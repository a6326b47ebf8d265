use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use millstone::common::clock::{Clock, SystemClock};
use millstone::job::RunMode;

use crate::common::config::TaskFrameworkConfig;
use crate::common::utils::network::get_hostname;
use crate::server::alarm::LogAlarmSink;
use crate::server::api::serve_api;
use crate::server::daemon::{DaemonContext, spawn_daemons};
use crate::server::event::EventBus;
use crate::server::resource::ResourceManager;
use crate::server::resource::k8s::{K8sResourceStrategy, KubePodClient};
use crate::server::resource::process::ProcessResourceStrategy;
use crate::server::store::MemoryJobStore;
use crate::server::supervisor::allocator::{AllocatorConfig, SupervisorAgentAllocator};
use crate::server::supervisor::client::HttpTaskClient;

/// Wires the control plane together without starting anything.
pub fn initialize_server(config: TaskFrameworkConfig) -> crate::Result<Arc<DaemonContext>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hostname = get_hostname(config.hostname.clone());

    let mut resource_manager = ResourceManager::new(clock.clone()).with_strategy(
        RunMode::Process,
        Arc::new(ProcessResourceStrategy::new(hostname)),
    );
    if let Some(k8s) = &config.k8s {
        resource_manager = resource_manager.with_strategy(
            RunMode::K8s,
            Arc::new(K8sResourceStrategy::new(
                Arc::new(KubePodClient::default()),
                k8s.clone(),
            )),
        );
    } else if config.run_mode.is_k8s() {
        log::warn!("Run mode is K8S but no [k8s] section is configured, pods cannot be created");
    }
    let resource_manager = Arc::new(resource_manager);

    let client = Arc::new(HttpTaskClient::new()?);
    let allocator = Arc::new(SupervisorAgentAllocator::new(
        client.clone(),
        resource_manager.clone(),
        clock.clone(),
        AllocatorConfig::from(&config),
    ));
    for endpoint in &config.supervisor_endpoints {
        allocator.register_endpoint(endpoint.clone());
    }

    Ok(Arc::new(DaemonContext {
        store: Arc::new(MemoryJobStore::new(clock.clone())),
        allocator,
        resource_manager,
        supervisor_client: client.clone(),
        executor_client: client,
        alarm: Arc::new(LogAlarmSink),
        events: EventBus::new(),
        clock,
        config: Arc::new(config),
    }))
}

/// Runs the control plane until interrupted.
pub async fn start_server(config: TaskFrameworkConfig) -> anyhow::Result<()> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
    let ctx = initialize_server(config)?;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Cannot bind control plane to {address}"))?;

    let (shutdown_sender, shutdown) = watch::channel(false);
    let daemons = spawn_daemons(&ctx, shutdown.clone());
    let api = tokio::spawn(serve_api(ctx.clone(), listener, shutdown));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down the control plane");
    // Receivers may be gone already
    let _ = shutdown_sender.send(true);
    for result in futures::future::join_all(daemons).await {
        result?;
    }
    api.await??;
    Ok(())
}
