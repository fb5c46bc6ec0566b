//! One generate activation, end to end.
//!
//! Resolve the policy and provider, wait for admission, invoke the provider
//! under the policy timeout and branch on the result. The admission permit
//! is released exactly once before `dispatch` returns, whatever the result;
//! for asynchronous providers it covers the creation call only. If the
//! dispatch future itself is dropped, the permit frees the slot on drop.

use anyhow::{Context, Result};
use genrelay_config::{ModelPolicy, PolicyTable};
use genrelay_core::{
    AppError, Artifact, AsyncTask, Clock, InvokeOutcome, JobDescriptor, JobStatus,
    MAX_TASK_TIMEOUT_S, SystemClock, TaskHandle,
};
use genrelay_limiter::{AdmissionController, Limits};
use genrelay_notify::Outbox;
use genrelay_providers::{GenerationProvider, ProviderRegistry};
use genrelay_queue::{ActivationKind, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::messages;

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// How a generate activation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Synchronous artifact delivered to the user.
    Delivered,
    /// Remote task created; its first poll is queued.
    PollScheduled { task_id: String },
    /// Upstream refused or delivery failed; the job is over.
    Failed { reason: String },
    /// Admission budget ran out; nothing was invoked.
    Busy,
    /// No policy or no provider for the model.
    Unroutable,
}

pub struct JobDispatcher {
    policies: Arc<PolicyTable>,
    providers: Arc<ProviderRegistry>,
    admission: Arc<AdmissionController>,
    queue: Arc<dyn JobQueue>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
    max_wait: Duration,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(
        policies: Arc<PolicyTable>,
        providers: Arc<ProviderRegistry>,
        admission: Arc<AdmissionController>,
        queue: Arc<dyn JobQueue>,
        outbox: Outbox,
    ) -> Self {
        Self {
            policies,
            providers,
            admission,
            queue,
            outbox,
            clock: Arc::new(SystemClock),
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Run one generate activation.
    ///
    /// `Err` means an unexpected fault (transport error, hard timeout,
    /// store or queue failure) that the queue layer may retry; the user and
    /// the status sink have already been told.
    pub async fn dispatch(&self, job: JobDescriptor) -> Result<DispatchOutcome> {
        job.validate()?;
        let model = job.model_key.as_str();

        let Some(policy) = self.policies.get(model) else {
            warn!(model, user = job.user_id, "unknown model");
            self.outbox
                .text(job.user_id, &messages::unknown_model(model))
                .await;
            self.outbox.status(job.job_id, JobStatus::Failed, None).await;
            return Ok(DispatchOutcome::Unroutable);
        };
        let Some(provider) = self.providers.get(model) else {
            warn!(model, user = job.user_id, "no provider for model");
            self.outbox
                .text(job.user_id, &messages::no_provider(model))
                .await;
            self.outbox.status(job.job_id, JobStatus::Failed, None).await;
            return Ok(DispatchOutcome::Unroutable);
        };

        let key = self.policies.admission_key(model).unwrap_or(model).to_string();
        let limits = Limits::new(
            policy.rpm_limit(),
            policy.concurrency_limit(),
            policy.window(),
        );
        let permit = match self.admission.acquire(&key, &limits, self.max_wait).await {
            Ok(permit) => permit,
            Err(e) => {
                if let Some(AppError::BudgetExceeded { reason, .. }) = e.downcast_ref::<AppError>() {
                    info!(model, key = %key, %reason, user = job.user_id, "admission budget exceeded");
                    self.outbox.text(job.user_id, messages::BUSY).await;
                    self.outbox.status(job.job_id, JobStatus::Failed, None).await;
                    return Ok(DispatchOutcome::Busy);
                }
                return Err(e.context(format!("admission failed for '{key}'")));
            }
        };

        let result = self.run_admitted(job, provider, policy).await;

        if let Err(e) = self.admission.release(permit).await {
            warn!(key = %key, error = %format!("{e:#}"), "failed to release admission slot; lease will reclaim it");
        }
        result
    }

    async fn run_admitted(
        &self,
        job: JobDescriptor,
        provider: Arc<dyn GenerationProvider>,
        policy: &ModelPolicy,
    ) -> Result<DispatchOutcome> {
        let timeout = policy.timeout();
        let invoked = match tokio::time::timeout(timeout, provider.invoke(&job.params)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                what: format!("'{}' invocation", job.model_key),
                seconds: timeout.as_secs(),
            }
            .into()),
        };

        match invoked {
            Ok(InvokeOutcome::Artifact(artifact)) => Ok(self.deliver(&job, &artifact).await),
            Ok(InvokeOutcome::Rejected { reason }) => Ok(self.reject(&job, reason).await),
            Ok(InvokeOutcome::Task(handle)) => {
                if !provider.supports_polling() {
                    let reason = AppError::PollingUnsupported(job.model_key.clone()).to_string();
                    error!(model = %job.model_key, task_id = %handle.id, "provider created a task it cannot poll");
                    return Ok(self.reject(&job, reason).await);
                }
                self.schedule_poll(job, handle).await
            }
            Err(e) => {
                if let Some(AppError::UpstreamRejected(reason)) = e.downcast_ref::<AppError>() {
                    let reason = reason.clone();
                    return Ok(self.reject(&job, reason).await);
                }
                error!(model = %job.model_key, user = job.user_id, error = %format!("{e:#}"), "generation failed");
                self.outbox.status(job.job_id, JobStatus::Failed, None).await;
                self.outbox.text(job.user_id, messages::INTERNAL_ERROR).await;
                Err(e)
            }
        }
    }

    async fn deliver(&self, job: &JobDescriptor, artifact: &Artifact) -> DispatchOutcome {
        if self.outbox.deliver_artifact(job.user_id, artifact).await {
            info!(model = %job.model_key, user = job.user_id, media_type = %artifact.media_type, "artifact delivered");
            self.outbox
                .status(job.job_id, JobStatus::Finished, None)
                .await;
            return DispatchOutcome::Delivered;
        }
        self.outbox.text(job.user_id, messages::DELIVERY_FAILED).await;
        self.outbox.status(job.job_id, JobStatus::Failed, None).await;
        DispatchOutcome::Failed {
            reason: "artifact delivery failed".to_string(),
        }
    }

    async fn reject(&self, job: &JobDescriptor, reason: String) -> DispatchOutcome {
        warn!(model = %job.model_key, user = job.user_id, reason = %reason, "generation rejected");
        self.outbox
            .text(job.user_id, &messages::generation_failed(&job.params.prompt))
            .await;
        self.outbox.status(job.job_id, JobStatus::Failed, None).await;
        DispatchOutcome::Failed { reason }
    }

    async fn schedule_poll(&self, job: JobDescriptor, handle: TaskHandle) -> Result<DispatchOutcome> {
        let started = self.outbox.text(job.user_id, messages::STARTED).await;
        let task = AsyncTask {
            task_id: handle.id.clone(),
            created_at: self.clock.now(),
            poll_interval_s: handle.poll_after_s.clamp(1, MAX_TASK_TIMEOUT_S),
            timeout_s: handle.timeout_s.min(MAX_TASK_TIMEOUT_S),
            status_message_id: started,
        };
        let job = job.with_task(task);
        self.outbox
            .status(job.job_id, JobStatus::Processing, Some(&handle.id))
            .await;

        let model = job.model_key.clone();
        self.queue
            .enqueue_activation(
                ActivationKind::Poll,
                job,
                Duration::from_secs(handle.poll_after_s.min(MAX_TASK_TIMEOUT_S)),
            )
            .await
            .with_context(|| format!("failed to enqueue first poll of task {}", handle.id))?;
        info!(model = %model, task_id = %handle.id, poll_after_s = handle.poll_after_s, "remote task created");
        Ok(DispatchOutcome::PollScheduled { task_id: handle.id })
    }
}
