//! Best-effort delivery of notifications and status callbacks.
//!
//! Job outcomes never depend on these side effects: failures are logged
//! and swallowed.

use genrelay_core::{Artifact, JobId, JobStatus, MessageId, UserId};
use std::sync::Arc;
use tracing::warn;

use crate::sink::{NoopStatusSink, Notifier, StatusSink};

#[derive(Clone)]
pub struct Outbox {
    notifier: Arc<dyn Notifier>,
    status: Arc<dyn StatusSink>,
    artifact_basename: String,
    artifact_caption: String,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("artifact_basename", &self.artifact_basename)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(notifier: Arc<dyn Notifier>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            notifier,
            status,
            artifact_basename: "generation".to_string(),
            artifact_caption: String::new(),
        }
    }

    pub fn without_status(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(notifier, Arc::new(NoopStatusSink))
    }

    pub fn with_artifact_naming(mut self, basename: impl Into<String>, caption: impl Into<String>) -> Self {
        self.artifact_basename = basename.into();
        self.artifact_caption = caption.into();
        self
    }

    /// `<basename>.<subtype>` for a delivered artifact.
    pub fn artifact_filename(&self, artifact: &Artifact) -> String {
        format!("{}.{}", self.artifact_basename, artifact.extension())
    }

    pub async fn text(&self, user: UserId, text: &str) -> Option<MessageId> {
        match self.notifier.send_text(user, text).await {
            Ok(id) => id,
            Err(e) => {
                warn!(user, error = %format!("{e:#}"), "failed to notify user");
                None
            }
        }
    }

    pub async fn edit(&self, user: UserId, message: MessageId, text: &str) {
        if let Err(e) = self.notifier.edit_text(user, message, text).await {
            warn!(user, message, error = %format!("{e:#}"), "failed to edit notification");
        }
    }

    /// Returns whether the artifact reached the user.
    pub async fn deliver_artifact(&self, user: UserId, artifact: &Artifact) -> bool {
        let filename = self.artifact_filename(artifact);
        match self
            .notifier
            .send_artifact(user, artifact, &filename, &self.artifact_caption)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(user, filename = %filename, error = %format!("{e:#}"), "failed to deliver artifact");
                false
            }
        }
    }

    /// Report a status transition; jobs without an id are not tracked.
    pub async fn status(&self, job_id: Option<JobId>, status: JobStatus, task_id: Option<&str>) {
        let Some(job_id) = job_id else {
            return;
        };
        if let Err(e) = self.status.job_status(job_id, status, task_id).await {
            warn!(job_id, status = status.as_str(), error = %format!("{e:#}"), "status callback failed");
        }
    }

    pub async fn succeeded(&self, job_id: Option<JobId>, results: &[String]) {
        let Some(job_id) = job_id else {
            return;
        };
        if let Err(e) = self.status.job_succeeded(job_id, results).await {
            warn!(job_id, error = %format!("{e:#}"), "success callback failed");
        }
    }
}
