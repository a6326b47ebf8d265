use std::path::{Path, PathBuf};

use async_trait::async_trait;

use millstone::common::Map;
use millstone::ids::JobId;
use millstone::messages::LogType;

use crate::executor::command::job_log_dir;

/// Log metadata key recording why logs could not be stored.
pub const LOG_STORAGE_FAILED_REASON: &str = "logStorageFailedReason";

/// Durable storage for the logs of finished jobs.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Stores the logs found in `log_dir` and returns their locations keyed by log type.
    async fn upload_log_files(&self, job_id: JobId, log_dir: &Path)
    -> crate::Result<Map<String, String>>;
}

/// Copies logs into a (usually shared or mounted) directory.
pub struct DirectoryLogStorage {
    target: PathBuf,
}

impl DirectoryLogStorage {
    pub fn new(target: PathBuf) -> Self {
        Self { target }
    }
}

#[async_trait]
impl LogStorage for DirectoryLogStorage {
    async fn upload_log_files(
        &self,
        job_id: JobId,
        log_dir: &Path,
    ) -> crate::Result<Map<String, String>> {
        let source = job_log_dir(log_dir, job_id);
        let target = job_log_dir(&self.target, job_id);
        tokio::fs::create_dir_all(&target).await?;

        let mut metadata = Map::default();
        for log_type in LogType::all() {
            let file = source.join(log_type.file_name());
            if !tokio::fs::try_exists(&file).await? {
                log::debug!("Log {} of job_id={job_id} does not exist", file.display());
                continue;
            }
            let destination = target.join(log_type.file_name());
            tokio::fs::copy(&file, &destination).await?;
            metadata.insert(
                log_type.to_string(),
                format!("file://{}", destination.display()),
            );
        }
        log::info!(
            "Stored {} log file(s) of job_id={job_id} into {}",
            metadata.len(),
            target.display()
        );
        Ok(metadata)
    }
}
