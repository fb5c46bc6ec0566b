//! The activation worker loop and its wiring from configuration.
//!
//! Up to `max_jobs` activations run at once, each bounded by
//! `job_timeout_seconds`. Successful activations are acknowledged. Failed
//! ones are handed back to the queue with `retry_delay_seconds` until
//! `max_tries` deliveries have been made, unless the error is terminal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use genrelay_config::{Config, QueueConfig, secret_from_env, validate_config};
use genrelay_core::AppError;
use genrelay_limiter::{AdmissionController, RedisStore};
use genrelay_notify::{HttpStatusSink, NoopStatusSink, Outbox, StatusSink, TelegramNotifier};
use genrelay_providers::ProviderRegistry;
use genrelay_queue::{Activation, JobQueue, RedisQueue};
use genrelay_scheduler::{JobDispatcher, PollScheduler, Scheduler};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Something that runs one claimed activation.
#[async_trait]
pub trait ActivationHandler: Send + Sync {
    async fn handle(&self, activation: &Activation) -> Result<()>;
}

#[async_trait]
impl ActivationHandler for Scheduler {
    async fn handle(&self, activation: &Activation) -> Result<()> {
        self.run(activation).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_jobs: usize,
    pub job_timeout: Duration,
    pub max_tries: u32,
    pub retry_delay: Duration,
    pub idle_poll: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(queue: &QueueConfig) -> Self {
        Self {
            max_jobs: queue.max_jobs.max(1),
            job_timeout: queue.job_timeout(),
            max_tries: queue.max_tries.max(1),
            retry_delay: queue.retry_delay(),
            idle_poll: queue.idle_poll(),
        }
    }
}

/// What happens to an activation after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
    /// Failed for good; acknowledged so it is not delivered again.
    Drop,
}

pub fn disposition(result: &Result<()>, attempt: u32, max_tries: u32) -> Disposition {
    let Err(e) = result else {
        return Disposition::Ack;
    };
    let terminal = e
        .downcast_ref::<AppError>()
        .is_some_and(AppError::is_terminal);
    if terminal || attempt.saturating_add(1) >= max_tries {
        Disposition::Drop
    } else {
        Disposition::Retry
    }
}

/// Build the production scheduler: Redis store and queue, configured
/// providers, Telegram notifier and optional status callback.
pub async fn build(config: &Config) -> Result<(Arc<RedisQueue>, Scheduler)> {
    validate_config(config)?;

    let store = Arc::new(
        RedisStore::connect(&config.store.redis_url, config.store.key_prefix.clone()).await?,
    );
    let queue = Arc::new(
        RedisQueue::connect(
            &config.store.redis_url,
            config.queue.name.clone(),
            config.queue.visibility_timeout(),
        )
        .await?,
    );
    let admission = Arc::new(
        AdmissionController::new(store.clone())
            .with_poll_interval(config.admission.poll_interval())
            .with_lease(config.admission.lease()),
    );
    let providers = Arc::new(ProviderRegistry::from_config(config)?);

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let bot_token = secret_from_env(&config.notify.bot_token_env)?;
    let notifier = Arc::new(TelegramNotifier::new(
        &config.notify.api_base,
        &bot_token,
        client.clone(),
    ));
    let status: Arc<dyn StatusSink> = match &config.status {
        Some(status) => Arc::new(HttpStatusSink::new(
            status,
            secret_from_env(&status.api_key_env)?,
            client,
        )),
        None => Arc::new(NoopStatusSink),
    };
    let outbox = Outbox::new(notifier, status).with_artifact_naming(
        config.notify.artifact_basename.clone(),
        config.notify.artifact_caption.clone(),
    );

    let dispatcher = JobDispatcher::new(
        Arc::new(config.policies.clone()),
        providers.clone(),
        admission,
        queue.clone(),
        outbox.clone(),
    )
    .with_max_wait(config.admission.max_wait());
    let poller = PollScheduler::new(providers, store, queue.clone(), outbox)
        .with_marker_ttl(config.admission.terminal_marker_ttl());

    info!(
        queue = %config.queue.name,
        models = config.policies.len(),
        providers = config.providers.len(),
        "worker wired"
    );
    Ok((queue, Scheduler::new(dispatcher, poller)))
}

/// Pull and run activations until `shutdown` resolves, then wait for the
/// activations already running.
pub async fn run<F>(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn ActivationHandler>,
    settings: WorkerSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let slots = Arc::new(Semaphore::new(settings.max_jobs));
    tokio::pin!(shutdown);
    info!(max_jobs = settings.max_jobs, "worker started");

    loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break,
            permit = slots.clone().acquire_owned() => permit.context("worker slots closed")?,
        };

        let claimed = tokio::select! {
            _ = &mut shutdown => break,
            claimed = queue.next_ready() => claimed,
        };
        match claimed {
            Ok(Some(activation)) => {
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    settle(queue.as_ref(), handler.as_ref(), activation, &settings).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(settings.idle_poll) => {}
                }
            }
            Err(e) => {
                drop(permit);
                warn!(error = %format!("{e:#}"), "failed to claim activation");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(settings.idle_poll) => {}
                }
            }
        }
    }

    info!("shutdown requested; draining running activations");
    let all = u32::try_from(settings.max_jobs).unwrap_or(u32::MAX);
    let _drained = slots
        .acquire_many(all)
        .await
        .context("worker slots closed while draining")?;
    info!("worker stopped");
    Ok(())
}

async fn settle(
    queue: &dyn JobQueue,
    handler: &dyn ActivationHandler,
    activation: Activation,
    settings: &WorkerSettings,
) {
    let id = activation.id;
    let result = match tokio::time::timeout(settings.job_timeout, handler.handle(&activation)).await
    {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            what: format!("{} activation {id}", activation.kind),
            seconds: settings.job_timeout.as_secs(),
        }
        .into()),
    };

    let disposition = disposition(&result, activation.attempt, settings.max_tries);
    if let Err(e) = &result {
        match disposition {
            Disposition::Retry => warn!(
                %id,
                attempt = activation.attempt,
                error = %format!("{e:#}"),
                "activation failed; retrying"
            ),
            _ => error!(
                %id,
                attempt = activation.attempt,
                error = %format!("{e:#}"),
                "activation failed; giving up"
            ),
        }
    }

    let settled = match disposition {
        Disposition::Ack | Disposition::Drop => queue.ack(&activation).await,
        Disposition::Retry => queue.retry(activation, settings.retry_delay).await,
    };
    match settled {
        Ok(()) => debug!(%id, ?disposition, "activation settled"),
        Err(e) => warn!(%id, error = %format!("{e:#}"), "failed to settle activation; it will be redelivered"),
    }
}
