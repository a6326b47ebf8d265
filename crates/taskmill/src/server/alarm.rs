use parking_lot::Mutex;

use millstone::Map;

pub const TASK_START_FAILED: &str = "TASK_START_FAILED";
pub const TASK_HEARTBEAT_TIMEOUT: &str = "TASK_HEARTBEAT_TIMEOUT";
pub const TASK_STOP_FAILED: &str = "TASK_STOP_FAILED";
pub const TASK_EXECUTOR_DESTROY_FAILED: &str = "TASK_EXECUTOR_DESTROY_FAILED";
pub const RESOURCE_DESTROY_FAILED: &str = "RESOURCE_DESTROY_FAILED";
pub const TASK_LOGIC_ERROR: &str = "TASK_LOGIC_ERROR";

pub type AlarmMessage = Map<String, String>;

/// Builds the attributes of an alarm about one job.
pub fn job_alarm(job_id: impl ToString, message: impl ToString) -> AlarmMessage {
    let mut alarm = AlarmMessage::default();
    alarm.insert("jobId".to_string(), job_id.to_string());
    alarm.insert("message".to_string(), message.to_string());
    alarm
}

/// Destination of operator-facing alarms.
pub trait AlarmSink: Send + Sync {
    fn alarm(&self, event_name: &str, message: AlarmMessage);
}

/// Writes alarms into the log.
#[derive(Default)]
pub struct LogAlarmSink;

impl AlarmSink for LogAlarmSink {
    fn alarm(&self, event_name: &str, message: AlarmMessage) {
        let mut attributes: Vec<_> = message.iter().collect();
        attributes.sort();
        log::warn!("Alarm {event_name}: {attributes:?}");
    }
}

/// Keeps alarms in memory.
#[derive(Default)]
pub struct RecordingAlarmSink {
    alarms: Mutex<Vec<(String, AlarmMessage)>>,
}

impl RecordingAlarmSink {
    pub fn events(&self) -> Vec<String> {
        self.alarms
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl AlarmSink for RecordingAlarmSink {
    fn alarm(&self, event_name: &str, message: AlarmMessage) {
        self.alarms.lock().push((event_name.to_string(), message));
    }
}
