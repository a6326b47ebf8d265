use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use millstone::job::RunMode;

use crate::server::alarm::{AlarmMessage, RESOURCE_DESTROY_FAILED};
use crate::server::daemon::{Daemon, DaemonContext, millis};
use crate::server::resource::DestroyOutcome;

/// Drives allocations and resource teardown, and collects abandoned pods.
pub struct ManageResourceDaemon {
    ctx: Arc<DaemonContext>,
}

impl ManageResourceDaemon {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    async fn destroy_abandoned(&self) {
        let abandoned = self.ctx.resource_manager.find_abandoned(
            self.ctx.store.as_ref(),
            self.ctx.config.single_fetch_abandoned_resource_rows,
        );
        for resource_id in abandoned {
            match self.ctx.resource_manager.destroy(&resource_id).await {
                Ok(DestroyOutcome::Destroyed) => {
                    log::info!("Abandoned resource {resource_id} destroyed")
                }
                Ok(DestroyOutcome::Skipped) => {}
                Err(error) if error.is_resource_busy() => {
                    log::debug!("Abandoned resource {resource_id} is still shutting down")
                }
                Err(error) => {
                    log::warn!("Destroying abandoned resource {resource_id} failed: {error}");
                    let mut message = AlarmMessage::default();
                    message.insert("resourceId".to_string(), resource_id.to_string());
                    message.insert("message".to_string(), error.to_string());
                    self.ctx.alarm.alarm(RESOURCE_DESTROY_FAILED, message);
                }
            }
        }
    }
}

#[async_trait]
impl Daemon for ManageResourceDaemon {
    fn name(&self) -> &'static str {
        "manage-resource"
    }

    fn interval(&self) -> Duration {
        millis(self.ctx.config.manage_resource_interval_ms)
    }

    async fn tick(&self) {
        self.ctx.allocator.process_pending_allocations().await;
        let destroyed = self.ctx.resource_manager.process_pending_actions().await;
        if destroyed > 0 {
            log::debug!("{destroyed} released resources destroyed");
        }
        if self.ctx.config.run_mode == RunMode::K8s {
            self.destroy_abandoned().await;
        }
    }
}
