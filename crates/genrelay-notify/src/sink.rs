use anyhow::Result;
use async_trait::async_trait;
use genrelay_core::{Artifact, JobId, JobStatus, MessageId, UserId};

/// Channel used to message end users.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a message; returns its id when the channel reports one.
    async fn send_text(&self, user: UserId, text: &str) -> Result<Option<MessageId>>;

    async fn edit_text(&self, user: UserId, message: MessageId, text: &str) -> Result<()>;

    async fn send_artifact(
        &self,
        user: UserId,
        artifact: &Artifact,
        filename: &str,
        caption: &str,
    ) -> Result<()>;
}

/// External job-tracking callback.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn job_status(&self, job_id: JobId, status: JobStatus, task_id: Option<&str>) -> Result<()>;

    async fn job_succeeded(&self, job_id: JobId, results: &[String]) -> Result<()>;
}

/// Used when no `[status]` section is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn job_status(&self, _job_id: JobId, _status: JobStatus, _task_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn job_succeeded(&self, _job_id: JobId, _results: &[String]) -> Result<()> {
        Ok(())
    }
}
