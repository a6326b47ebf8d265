use tokio::sync::broadcast;

use millstone::JobId;
use millstone::job::JobStatus;
use millstone::result::TaskResult;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A job reached a terminal status.
    JobTerminate { job_id: JobId, status: JobStatus },
    /// A new task result was ingested.
    TaskResult {
        job_id: JobId,
        job_type: String,
        result: TaskResult,
    },
}

/// Fan-out of job events to in-process listeners.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: JobEvent) {
        log::debug!("Publishing event {event:?}");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
