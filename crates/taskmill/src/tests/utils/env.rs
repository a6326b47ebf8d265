use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use millstone::JobId;
use millstone::common::clock::ManualClock;
use millstone::job::{Job, JobStatus, RunMode};

use crate::common::config::TaskFrameworkConfig;
use crate::server::alarm::RecordingAlarmSink;
use crate::server::daemon::DaemonContext;
use crate::server::event::{EventBus, JobEvent};
use crate::server::resource::ResourceManager;
use crate::server::resource::process::ProcessResourceStrategy;
use crate::server::store::MemoryJobStore;
use crate::server::supervisor::allocator::{AllocatorConfig, SupervisorAgentAllocator};
use crate::tests::utils::mocks::{MockExecutorClient, MockResourceStrategy, MockSupervisorClient};
use crate::tests::utils::{TEST_HOSTNAME, test_clock};

/// Control plane wired to in-memory mocks. Process resources are real and owned by
/// [`TEST_HOSTNAME`], pods go to [`MockResourceStrategy`].
pub struct TestEnv {
    pub ctx: Arc<DaemonContext>,
    pub clock: Arc<ManualClock>,
    pub supervisor: Arc<MockSupervisorClient>,
    pub executor: Arc<MockExecutorClient>,
    pub strategy: Arc<MockResourceStrategy>,
    pub alarms: Arc<RecordingAlarmSink>,
    events: Mutex<broadcast::Receiver<JobEvent>>,
}

impl TestEnv {
    pub fn new(configure: impl FnOnce(&mut TaskFrameworkConfig)) -> Self {
        let mut config = TaskFrameworkConfig::default();
        configure(&mut config);

        let clock = Arc::new(test_clock());
        let strategy = Arc::new(MockResourceStrategy::default());
        let resource_manager = Arc::new(
            ResourceManager::new(clock.clone())
                .with_strategy(
                    RunMode::Process,
                    Arc::new(ProcessResourceStrategy::new(TEST_HOSTNAME.to_string())),
                )
                .with_strategy(RunMode::K8s, strategy.clone()),
        );
        let supervisor = Arc::new(MockSupervisorClient::default());
        let executor = Arc::new(MockExecutorClient::default());
        let alarms = Arc::new(RecordingAlarmSink::default());
        let allocator = Arc::new(SupervisorAgentAllocator::new(
            supervisor.clone(),
            resource_manager.clone(),
            clock.clone(),
            AllocatorConfig::from(&config),
        ));
        let events = EventBus::new();
        let receiver = events.subscribe();

        let ctx = Arc::new(DaemonContext {
            config: Arc::new(config),
            store: Arc::new(MemoryJobStore::new(clock.clone())),
            allocator,
            resource_manager,
            supervisor_client: supervisor.clone(),
            executor_client: executor.clone(),
            alarm: alarms.clone(),
            events,
            clock: clock.clone(),
        });
        Self {
            ctx,
            clock,
            supervisor,
            executor,
            strategy,
            alarms,
            events: Mutex::new(receiver),
        }
    }

    pub fn insert_job(&self, job: Job) {
        self.ctx.store.insert(job).unwrap();
    }

    pub fn status(&self, job_id: u64) -> JobStatus {
        self.ctx.store.get(JobId::new(job_id)).unwrap().status
    }

    /// Terminal transitions announced since the last call.
    pub fn terminate_events(&self) -> Vec<(JobId, JobStatus)> {
        let mut receiver = self.events.lock();
        let mut events = vec![];
        while let Ok(event) = receiver.try_recv() {
            if let JobEvent::JobTerminate { job_id, status } = event {
                events.push((job_id, status));
            }
        }
        events
    }
}
