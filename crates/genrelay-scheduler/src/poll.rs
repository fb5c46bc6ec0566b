//! Poll activations for asynchronous jobs.
//!
//! Each activation performs at most one upstream poll and then either
//! re-enqueues itself or ends the job. Terminal transitions claim a marker
//! in the shared store before any notification goes out, so redelivered
//! or duplicated activations never notify twice.

use anyhow::Result;
use genrelay_core::{AppError, AsyncTask, Clock, JobDescriptor, JobStatus, PollOutcome, PollState, SystemClock};
use genrelay_limiter::SharedStore;
use genrelay_notify::Outbox;
use genrelay_providers::ProviderRegistry;
use genrelay_queue::{ActivationKind, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::messages;

const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What one poll activation did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// Another activation already finished the job; nothing was done.
    AlreadyTerminal,
    /// Next poll queued after `delay`; `state` is `Pending` or `RetryScheduled`.
    Rescheduled { state: PollState, delay: Duration },
    Succeeded { result: String },
    Failed { reason: String },
}

impl PollStep {
    pub fn state(&self) -> Option<PollState> {
        match self {
            Self::AlreadyTerminal => None,
            Self::Rescheduled { state, .. } => Some(*state),
            Self::Succeeded { .. } => Some(PollState::Succeeded),
            Self::Failed { .. } => Some(PollState::Failed),
        }
    }
}

pub struct PollScheduler {
    providers: Arc<ProviderRegistry>,
    store: Arc<dyn SharedStore>,
    queue: Arc<dyn JobQueue>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
    marker_ttl: Duration,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("marker_ttl", &self.marker_ttl)
            .finish_non_exhaustive()
    }
}

impl PollScheduler {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        store: Arc<dyn SharedStore>,
        queue: Arc<dyn JobQueue>,
        outbox: Outbox,
    ) -> Self {
        Self {
            providers,
            store,
            queue,
            outbox,
            clock: Arc::new(SystemClock),
            marker_ttl: DEFAULT_MARKER_TTL,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }

    pub async fn activate(&self, job: JobDescriptor) -> Result<PollStep> {
        job.validate()?;
        let task = job.async_task()?.clone();
        let marker = job.terminal_marker();

        if let Some(state) = self.store.terminal_state(&marker).await? {
            debug!(marker = %marker, state = %state, "job already terminal; dropping activation");
            return Ok(PollStep::AlreadyTerminal);
        }

        if task.is_expired(self.clock.now()) {
            let reason = AppError::Timeout {
                what: format!("remote task {}", task.task_id),
                seconds: task.timeout_s,
            }
            .to_string();
            return self.fail(&job, &task, &marker, reason, messages::TIMED_OUT.to_string()).await;
        }

        let Some(provider) = self.providers.poller(&job.model_key) else {
            let reason = AppError::PollingUnsupported(job.model_key.clone()).to_string();
            let text = messages::generation_failed(&job.params.prompt);
            return self.fail(&job, &task, &marker, reason, text).await;
        };

        match provider.poll(&task.task_id).await {
            Err(e) => {
                // A refused poll (unknown task, bad credentials) will not recover.
                if let Some(AppError::UpstreamRejected(reason)) = e.downcast_ref::<AppError>() {
                    let reason = reason.clone();
                    let text = messages::generation_failed(&job.params.prompt);
                    return self.fail(&job, &task, &marker, reason, text).await;
                }
                warn!(
                    model = %job.model_key,
                    task_id = %task.task_id,
                    error = %format!("{e:#}"),
                    "poll failed; retrying"
                );
                self.reschedule(job, &task, PollState::RetryScheduled).await
            }
            Ok(PollOutcome::Failed { reason }) => {
                let text = messages::generation_failed(&job.params.prompt);
                self.fail(&job, &task, &marker, reason, text).await
            }
            Ok(PollOutcome::Succeeded { result }) => self.succeed(&job, &task, &marker, result).await,
            Ok(PollOutcome::Pending { progress }) => {
                if let (Some(fraction), Some(message)) = (progress, task.status_message_id) {
                    self.outbox
                        .edit(job.user_id, message, &messages::progress(fraction))
                        .await;
                }
                self.reschedule(job, &task, PollState::Pending).await
            }
        }
    }

    async fn reschedule(&self, job: JobDescriptor, task: &AsyncTask, state: PollState) -> Result<PollStep> {
        let delay = Duration::from_secs(task.poll_interval_s);
        self.queue
            .enqueue_activation(ActivationKind::Poll, job, delay)
            .await?;
        debug!(task_id = %task.task_id, %state, delay_s = task.poll_interval_s, "poll rescheduled");
        Ok(PollStep::Rescheduled { state, delay })
    }

    async fn succeed(
        &self,
        job: &JobDescriptor,
        task: &AsyncTask,
        marker: &str,
        result: String,
    ) -> Result<PollStep> {
        if !self.claim(marker, PollState::Succeeded).await? {
            return Ok(PollStep::AlreadyTerminal);
        }
        info!(model = %job.model_key, task_id = %task.task_id, "remote task succeeded");
        self.outbox
            .succeeded(job.job_id, std::slice::from_ref(&result))
            .await;
        self.outbox.text(job.user_id, &messages::ready(&result)).await;
        Ok(PollStep::Succeeded { result })
    }

    async fn fail(
        &self,
        job: &JobDescriptor,
        task: &AsyncTask,
        marker: &str,
        reason: String,
        user_text: String,
    ) -> Result<PollStep> {
        if !self.claim(marker, PollState::Failed).await? {
            return Ok(PollStep::AlreadyTerminal);
        }
        warn!(model = %job.model_key, task_id = %task.task_id, reason = %reason, "remote task failed");
        self.outbox
            .status(job.job_id, JobStatus::Failed, Some(&task.task_id))
            .await;
        self.outbox.text(job.user_id, &user_text).await;
        Ok(PollStep::Failed { reason })
    }

    async fn claim(&self, marker: &str, state: PollState) -> Result<bool> {
        let claimed = self
            .store
            .claim_terminal(marker, state.as_str(), self.marker_ttl)
            .await?;
        if !claimed {
            debug!(marker, %state, "terminal marker already claimed");
        }
        Ok(claimed)
    }
}
