use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;

use millstone::endpoint::ExecutorIdentifier;
use millstone::resource::{PROCESS_RESOURCE_TYPE, ResourceID, ResourceLocation, ResourceSpec};
use millstone::{JobId, Map};

use crate::common::error::TaskmillError;
use crate::common::utils::network::is_local_host;
use crate::server::resource::{DestroyOutcome, ResourceProbe, ResourceStrategy};

/// Number of SIGTERMs sent to a process before it is killed.
const TERMINATE_ATTEMPTS: u32 = 3;

/// Executors running as OS processes next to a supervisor.
///
/// Allocation needs no real work and returns a sentinel resource. A process
/// resource is `namespace = host, name = pid`; only processes on this host are
/// destroyed, others are skipped.
pub struct ProcessResourceStrategy {
    hostname: String,
    terminate_attempts: Mutex<Map<i32, u32>>,
}

impl ProcessResourceStrategy {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            terminate_attempts: Default::default(),
        }
    }

    /// Resource of the process behind an executor identifier.
    pub fn resource_id_of(identifier: &ExecutorIdentifier) -> Option<ResourceID> {
        let pid = identifier.pid()?;
        Some(ResourceID::new(
            ResourceLocation::local(),
            PROCESS_RESOURCE_TYPE,
            identifier.host.clone(),
            pid.to_string(),
        ))
    }

    fn terminate(&self, id: &ResourceID, pid: i32) -> crate::Result<DestroyOutcome> {
        let pid = Pid::from_raw(pid);
        match signal::kill(pid, None) {
            Err(Errno::ESRCH) => {
                self.terminate_attempts.lock().remove(&pid.as_raw());
                return Ok(DestroyOutcome::Destroyed);
            }
            Err(error) => {
                return Err(TaskmillError::GenericError(format!(
                    "Cannot check process {pid}: {error}"
                )));
            }
            Ok(()) => {}
        }

        let attempt = {
            let mut attempts = self.terminate_attempts.lock();
            let attempt = attempts.entry(pid.as_raw()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        let signal = if attempt > TERMINATE_ATTEMPTS {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        log::debug!("Sending {signal} to executor process {pid} (attempt {attempt})");
        // Executors lead their own process group, fall back to the single process
        if let Err(error) = signal::killpg(pid, signal).or_else(|_| signal::kill(pid, signal)) {
            if error == Errno::ESRCH {
                self.terminate_attempts.lock().remove(&pid.as_raw());
                return Ok(DestroyOutcome::Destroyed);
            }
            return Err(TaskmillError::GenericError(format!(
                "Cannot send {signal} to process {pid}: {error}"
            )));
        }
        Err(TaskmillError::ResourceBusy(id.clone()))
    }
}

#[async_trait]
impl ResourceStrategy for ProcessResourceStrategy {
    async fn allocate(
        &self,
        job_id: JobId,
        location: &ResourceLocation,
        _spec: &ResourceSpec,
    ) -> crate::Result<ResourceID> {
        Ok(ResourceID::new(
            location.clone(),
            PROCESS_RESOURCE_TYPE,
            self.hostname.clone(),
            format!("job-{job_id}"),
        ))
    }

    async fn query(&self, _id: &ResourceID) -> crate::Result<ResourceProbe> {
        Ok(ResourceProbe::Ready {
            endpoint: self.hostname.clone(),
        })
    }

    async fn destroy(&self, id: &ResourceID) -> crate::Result<DestroyOutcome> {
        if !is_local_host(&id.namespace, &self.hostname) {
            log::debug!("Process {} runs on another host, skipping", id);
            return Ok(DestroyOutcome::Skipped);
        }
        match id.name.parse::<i32>() {
            Ok(pid) if pid > 0 => self.terminate(id, pid),
            // Sentinel resources own no process
            _ => Ok(DestroyOutcome::Destroyed),
        }
    }
}
