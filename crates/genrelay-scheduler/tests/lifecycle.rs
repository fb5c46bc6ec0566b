//! Job lifecycle scenarios: dispatch branches, slot release and the poll
//! state machine, driven with recording sinks and a scripted provider.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use genrelay_config::{ModelPolicy, PolicyTable};
use genrelay_core::{
    AppError, Artifact, AsyncTask, GenerationParams, InvokeOutcome, JobDescriptor, JobId,
    JobStatus, ManualClock, MessageId, PollOutcome, PollState, TaskHandle, UserId,
};
use genrelay_limiter::{AdmissionController, InMemoryStore, Limits, SharedStore};
use genrelay_notify::{Notifier, Outbox, StatusSink};
use genrelay_providers::{GenerationProvider, ProviderRegistry};
use genrelay_queue::{ActivationKind, InMemoryQueue};
use genrelay_scheduler::{DispatchOutcome, JobDispatcher, PollScheduler, PollStep, messages};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MODEL: &str = "runway";
const USER: UserId = 501;
const JOB: JobId = 77;

#[derive(Default)]
struct RecordingNotifier {
    next_id: AtomicI64,
    texts: Mutex<Vec<(UserId, String)>>,
    edits: Mutex<Vec<(UserId, MessageId, String)>>,
    files: Mutex<Vec<(UserId, String)>>,
    fail_artifacts: bool,
}

impl RecordingNotifier {
    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_text(&self, user: UserId, text: &str) -> Result<Option<MessageId>> {
        self.texts.lock().unwrap().push((user, text.to_string()));
        Ok(Some(100 + self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn edit_text(&self, user: UserId, message: MessageId, text: &str) -> Result<()> {
        self.edits
            .lock()
            .unwrap()
            .push((user, message, text.to_string()));
        Ok(())
    }

    async fn send_artifact(&self, user: UserId, _: &Artifact, filename: &str, _: &str) -> Result<()> {
        if self.fail_artifacts {
            bail!("upload refused");
        }
        self.files.lock().unwrap().push((user, filename.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingStatus {
    statuses: Mutex<Vec<(JobId, JobStatus, Option<String>)>>,
    successes: Mutex<Vec<(JobId, Vec<String>)>>,
}

impl RecordingStatus {
    fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.lock().unwrap().iter().map(|(_, s, _)| *s).collect()
    }
}

#[async_trait]
impl StatusSink for RecordingStatus {
    async fn job_status(&self, job_id: JobId, status: JobStatus, task_id: Option<&str>) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((job_id, status, task_id.map(str::to_string)));
        Ok(())
    }

    async fn job_succeeded(&self, job_id: JobId, results: &[String]) -> Result<()> {
        self.successes.lock().unwrap().push((job_id, results.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedProvider {
    invokes: Mutex<VecDeque<Result<InvokeOutcome>>>,
    polls: Mutex<VecDeque<Result<PollOutcome>>>,
    invoke_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    polling: bool,
    invoke_delay: Duration,
}

impl ScriptedProvider {
    fn invoking(outcome: Result<InvokeOutcome>) -> Self {
        Self {
            invokes: Mutex::new(VecDeque::from([outcome])),
            polling: true,
            ..Default::default()
        }
    }

    fn polling(outcomes: Vec<Result<PollOutcome>>) -> Self {
        Self {
            polls: Mutex::new(outcomes.into()),
            polling: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, _params: &GenerationParams) -> Result<InvokeOutcome> {
        self.invoke_calls.fetch_add(1, Ordering::SeqCst);
        if !self.invoke_delay.is_zero() {
            tokio::time::sleep(self.invoke_delay).await;
        }
        self.invokes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted invoke left")))
    }

    fn supports_polling(&self) -> bool {
        self.polling
    }

    async fn poll(&self, _task_id: &str) -> Result<PollOutcome> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted poll left")))
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryQueue>,
    notifier: Arc<RecordingNotifier>,
    status: Arc<RecordingStatus>,
    admission: Arc<AdmissionController>,
    dispatcher: JobDispatcher,
    poller: PollScheduler,
}

fn policy() -> ModelPolicy {
    ModelPolicy {
        rpm: Some(2),
        window_seconds: 60,
        concurrency: Some(1),
        timeout_seconds: 600,
        limit_key: None,
    }
}

fn harness_with(provider: Arc<ScriptedProvider>, policy: ModelPolicy, notifier: RecordingNotifier) -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let queue = Arc::new(InMemoryQueue::with_clock(clock.clone()));
    let notifier = Arc::new(notifier);
    let status = Arc::new(RecordingStatus::default());
    let outbox = Outbox::new(notifier.clone(), status.clone());
    let admission = Arc::new(
        AdmissionController::new(store.clone())
            .with_clock(clock.clone())
            .with_poll_interval(Duration::from_millis(10)),
    );
    let policies = Arc::new(PolicyTable::new().with_policy(MODEL, policy));
    let providers = Arc::new(ProviderRegistry::new().with(MODEL, provider));

    let dispatcher = JobDispatcher::new(
        policies,
        providers.clone(),
        admission.clone(),
        queue.clone(),
        outbox.clone(),
    )
    .with_clock(clock.clone())
    .with_max_wait(Duration::ZERO);
    let poller = PollScheduler::new(providers, store.clone(), queue.clone(), outbox)
        .with_clock(clock.clone());

    Harness {
        clock,
        store,
        queue,
        notifier,
        status,
        admission,
        dispatcher,
        poller,
    }
}

fn harness(provider: Arc<ScriptedProvider>) -> Harness {
    harness_with(provider, policy(), RecordingNotifier::default())
}

fn job() -> JobDescriptor {
    let mut job = JobDescriptor::new(MODEL, USER);
    job.job_id = Some(JOB);
    job.params.prompt = "a red fox in snow".into();
    job
}

fn async_job(h: &Harness) -> JobDescriptor {
    job().with_task(AsyncTask {
        task_id: "T1".into(),
        created_at: genrelay_core::Clock::now(h.clock.as_ref()),
        poll_interval_s: 5,
        timeout_s: 60,
        status_message_id: Some(100),
    })
}

async fn holders(h: &Harness) -> u64 {
    h.admission
        .snapshot(MODEL, Duration::from_secs(60))
        .await
        .unwrap()
        .holders
}

#[tokio::test]
async fn async_creation_schedules_one_poll_and_releases_slot() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::Task(TaskHandle {
        id: "T1".into(),
        poll_after_s: 5,
        timeout_s: 60,
    }))));
    let h = harness(provider);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::PollScheduled { task_id: "T1".into() });

    assert_eq!(h.notifier.texts(), vec![messages::STARTED.to_string()]);
    assert_eq!(h.queue.pending_delays(ActivationKind::Poll), vec![Duration::from_secs(5)]);
    assert_eq!(holders(&h).await, 0);

    let statuses = h.status.statuses.lock().unwrap().clone();
    assert_eq!(statuses, vec![(JOB, JobStatus::Processing, Some("T1".to_string()))]);

    let pending = h.queue.pending();
    let task = pending[0].activation.descriptor.task.clone().unwrap();
    assert_eq!(task.task_id, "T1");
    assert_eq!(task.timeout_s, 60);
    assert_eq!(task.status_message_id, Some(100));
}

#[tokio::test]
async fn sync_artifact_is_delivered_and_reported_finished() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::Artifact(
        Artifact::new(vec![0x89, 0x50], "image/png"),
    ))));
    let h = harness(provider);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered);
    assert_eq!(
        *h.notifier.files.lock().unwrap(),
        vec![(USER, "generation.png".to_string())]
    );
    assert_eq!(h.status.statuses(), vec![JobStatus::Finished]);
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test]
async fn failed_artifact_delivery_reports_failed() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::Artifact(
        Artifact::new(vec![1], "image/png"),
    ))));
    let notifier = RecordingNotifier {
        fail_artifacts: true,
        ..Default::default()
    };
    let h = harness_with(provider, policy(), notifier);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
    assert_eq!(h.notifier.texts(), vec![messages::DELIVERY_FAILED.to_string()]);
}

#[tokio::test]
async fn rejection_echoes_prompt_and_reports_failed() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::rejected(
        "finish reason IMAGE_SAFETY",
    ))));
    let h = harness(provider);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Failed {
            reason: "finish reason IMAGE_SAFETY".into()
        }
    );
    assert_eq!(
        h.notifier.texts(),
        vec![messages::generation_failed("a red fox in snow")]
    );
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test]
async fn upstream_rejected_error_is_a_terminal_failure() {
    let provider = Arc::new(ScriptedProvider::invoking(Err(AppError::UpstreamRejected(
        "status 400: bad ratio".into(),
    )
    .into())));
    let h = harness(provider);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test]
async fn transport_fault_propagates_after_reporting() {
    let provider = Arc::new(ScriptedProvider::invoking(Err(AppError::TransportFault {
        endpoint: "https://api.dev.runwayml.com".into(),
        message: "connection reset".into(),
    }
    .into())));
    let h = harness(provider);

    let err = h.dispatcher.dispatch(job()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::TransportFault { .. })
    ));
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
    assert_eq!(h.notifier.texts(), vec![messages::INTERNAL_ERROR.to_string()]);
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_cancels_invocation_and_releases_slot() {
    let provider = Arc::new(ScriptedProvider {
        invokes: Mutex::new(VecDeque::from([Ok(InvokeOutcome::rejected("late"))])),
        invoke_delay: Duration::from_secs(30),
        ..Default::default()
    });
    let policy = ModelPolicy {
        timeout_seconds: 2,
        ..policy()
    };
    let h = harness_with(provider, policy, RecordingNotifier::default());

    let err = h.dispatcher.dispatch(job()).await.unwrap_err();
    match err.downcast_ref::<AppError>() {
        Some(AppError::Timeout { seconds, .. }) => assert_eq!(*seconds, 2),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_dispatch_frees_its_slot() {
    let provider = Arc::new(ScriptedProvider {
        invokes: Mutex::new(VecDeque::from([Ok(InvokeOutcome::rejected("late"))])),
        invoke_delay: Duration::from_secs(500),
        ..Default::default()
    });
    let h = harness(provider);

    let cancelled = tokio::time::timeout(Duration::from_secs(100), h.dispatcher.dispatch(job())).await;
    assert!(cancelled.is_err());
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test]
async fn busy_when_admission_budget_exhausted() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::rejected("unused"))));
    let h = harness(provider.clone());

    let limits = Limits::new(Some(2), Some(1), Duration::from_secs(60));
    let held = h.admission.try_acquire(MODEL, &limits).await.unwrap().unwrap();

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Busy);
    assert_eq!(h.notifier.texts(), vec![messages::BUSY.to_string()]);
    assert_eq!(provider.invoke_calls.load(Ordering::SeqCst), 0);
    assert_eq!(holders(&h).await, 1);
    h.admission.release(held).await.unwrap();
}

#[tokio::test]
async fn unknown_model_is_not_started() {
    let provider = Arc::new(ScriptedProvider::invoking(Ok(InvokeOutcome::rejected("unused"))));
    let h = harness(provider.clone());

    let outcome = h
        .dispatcher
        .dispatch(JobDescriptor::new("flux", USER))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Unroutable);
    assert_eq!(h.notifier.texts(), vec![messages::unknown_model("flux")]);
    assert_eq!(provider.invoke_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn task_from_non_polling_provider_fails() {
    let provider = Arc::new(ScriptedProvider {
        invokes: Mutex::new(VecDeque::from([Ok(InvokeOutcome::Task(TaskHandle {
            id: "T9".into(),
            poll_after_s: 5,
            timeout_s: 60,
        }))])),
        polling: false,
        ..Default::default()
    });
    let h = harness(provider);

    let outcome = h.dispatcher.dispatch(job()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert!(h.queue.pending().is_empty());
    assert_eq!(holders(&h).await, 0);
}

#[tokio::test]
async fn poll_past_deadline_fails_without_polling() {
    let provider = Arc::new(ScriptedProvider::polling(vec![]));
    let h = harness(provider.clone());
    let job = async_job(&h);
    h.clock.advance(chrono::Duration::seconds(61));

    let step = h.poller.activate(job).await.unwrap();
    match &step {
        PollStep::Failed { reason } => assert!(reason.contains("Timed out after 60s")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(step.state(), Some(PollState::Failed));
    assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.notifier.texts(), vec![messages::TIMED_OUT.to_string()]);
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
    assert!(h.queue.pending().is_empty());
}

#[tokio::test]
async fn poll_at_deadline_still_polls() {
    let provider = Arc::new(ScriptedProvider::polling(vec![Ok(PollOutcome::Pending {
        progress: None,
    })]));
    let h = harness(provider.clone());
    let job = async_job(&h);
    h.clock.advance(chrono::Duration::seconds(60));

    let step = h.poller.activate(job).await.unwrap();
    assert_eq!(step.state(), Some(PollState::Pending));
    assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pending_with_progress_edits_started_message_and_reschedules() {
    let provider = Arc::new(ScriptedProvider::polling(vec![Ok(PollOutcome::Pending {
        progress: Some(0.4),
    })]));
    let h = harness(provider);

    let step = h.poller.activate(async_job(&h)).await.unwrap();
    assert_eq!(
        step,
        PollStep::Rescheduled {
            state: PollState::Pending,
            delay: Duration::from_secs(5)
        }
    );
    assert!(!step.state().unwrap().is_terminal());
    assert_eq!(
        *h.notifier.edits.lock().unwrap(),
        vec![(USER, 100, messages::progress(0.4))]
    );
    assert_eq!(h.queue.pending_delays(ActivationKind::Poll), vec![Duration::from_secs(5)]);
    assert!(h.status.statuses().is_empty());
}

#[tokio::test]
async fn poll_fault_reschedules_as_retry() {
    let provider = Arc::new(ScriptedProvider::polling(vec![Err(AppError::TransportFault {
        endpoint: "https://api.kie.ai".into(),
        message: "timeout".into(),
    }
    .into())]));
    let h = harness(provider);

    let step = h.poller.activate(async_job(&h)).await.unwrap();
    assert_eq!(step.state(), Some(PollState::RetryScheduled));
    assert_eq!(h.queue.pending().len(), 1);
    assert!(h.notifier.texts().is_empty());
}

#[tokio::test]
async fn poll_rejected_by_upstream_is_terminal() {
    let provider = Arc::new(ScriptedProvider::polling(vec![Err(AppError::UpstreamRejected(
        "status 404: task not found".into(),
    )
    .into())]));
    let h = harness(provider.clone());

    let step = h.poller.activate(async_job(&h)).await.unwrap();
    assert_eq!(
        step,
        PollStep::Failed {
            reason: "status 404: task not found".into()
        }
    );
    assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 1);
    assert!(h.queue.pending().is_empty());
    assert_eq!(
        h.notifier.texts(),
        vec![messages::generation_failed("a red fox in snow")]
    );
    assert_eq!(h.status.statuses(), vec![JobStatus::Failed]);
}

#[tokio::test]
async fn upstream_failure_is_terminal() {
    let provider = Arc::new(ScriptedProvider::polling(vec![Ok(PollOutcome::Failed {
        reason: "moderation".into(),
    })]));
    let h = harness(provider);

    let step = h.poller.activate(async_job(&h)).await.unwrap();
    assert_eq!(
        step,
        PollStep::Failed {
            reason: "moderation".into()
        }
    );
    let statuses = h.status.statuses.lock().unwrap().clone();
    assert_eq!(statuses, vec![(JOB, JobStatus::Failed, Some("T1".to_string()))]);
    assert!(h.queue.pending().is_empty());
}

#[tokio::test]
async fn success_callback_fires_once_despite_redelivery() {
    let provider = Arc::new(ScriptedProvider::polling(vec![
        Ok(PollOutcome::Succeeded {
            result: "https://x".into(),
        }),
        Ok(PollOutcome::Succeeded {
            result: "https://x".into(),
        }),
    ]));
    let h = harness(provider.clone());
    let job = async_job(&h);

    let first = h.poller.activate(job.clone()).await.unwrap();
    assert_eq!(
        first,
        PollStep::Succeeded {
            result: "https://x".into()
        }
    );
    let again = h.poller.activate(job).await.unwrap();
    assert_eq!(again, PollStep::AlreadyTerminal);

    assert_eq!(
        *h.status.successes.lock().unwrap(),
        vec![(JOB, vec!["https://x".to_string()])]
    );
    assert_eq!(provider.poll_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifier.texts(), vec![messages::ready("https://x")]);
    assert_eq!(
        h.store.terminal_state("task:runway:T1").await.unwrap().as_deref(),
        Some("succeeded")
    );
}

#[tokio::test]
async fn concurrent_duplicates_notify_once() {
    let provider = Arc::new(ScriptedProvider::polling(vec![
        Ok(PollOutcome::Succeeded {
            result: "https://x".into(),
        }),
        Ok(PollOutcome::Succeeded {
            result: "https://x".into(),
        }),
    ]));
    let h = harness(provider);
    let job = async_job(&h);

    let (a, b) = tokio::join!(h.poller.activate(job.clone()), h.poller.activate(job));
    let steps = [a.unwrap(), b.unwrap()];
    let succeeded = steps
        .iter()
        .filter(|s| matches!(s, PollStep::Succeeded { .. }))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(h.status.successes.lock().unwrap().len(), 1);
}
