use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Chat identity of the end user a job reports back to.
pub type UserId = i64;
/// Identity of the job in the external tracking system.
pub type JobId = i64;
/// Identity of a previously sent notification (for edits).
pub type MessageId = i64;

/// Longest remote task lifetime a descriptor may carry (30 days).
pub const MAX_TASK_TIMEOUT_S: u64 = 30 * 24 * 60 * 60;

/// Why the admission protocol refused a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyReason {
    Concurrency,
    #[serde(rename = "rpm")]
    Rate,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrency => "concurrency",
            Self::Rate => "rpm",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DenyReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrency" => Ok(Self::Concurrency),
            "rpm" => Ok(Self::Rate),
            other => Err(format!("unknown deny reason '{other}'")),
        }
    }
}

/// Provider-call parameters carried by a job.
///
/// Adapters pick the fields they understand; `body`/`request_url` pass a
/// raw upstream request through for providers whose payload is built by
/// the enqueuing side.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Test jobs are rejected by adapters without contacting upstream.
    #[serde(default)]
    pub is_test: bool,
}

/// Asynchronous extension attached once a remote task has been created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncTask {
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub poll_interval_s: u64,
    pub timeout_s: u64,
    /// The "work started" message, edited in place with progress updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message_id: Option<MessageId>,
}

impl AsyncTask {
    /// `None` when the deadline is not representable.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = TimeDelta::try_seconds(i64::try_from(self.timeout_s).ok()?)?;
        self.created_at.checked_add_signed(timeout)
    }

    /// Strictly past the deadline; an activation exactly at the deadline
    /// still polls. A task without a representable deadline is expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_none_or(|deadline| now > deadline)
    }
}

/// The payload flowing through dispatch and poll activations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub model_key: String,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<AsyncTask>,
}

impl JobDescriptor {
    pub fn new(model_key: impl Into<String>, user_id: UserId) -> Self {
        Self {
            model_key: model_key.into(),
            user_id,
            job_id: None,
            params: GenerationParams::default(),
            task: None,
        }
    }

    /// Boundary validation for descriptors arriving from the queue.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model_key.trim().is_empty() {
            return Err(AppError::InvalidDescriptor("model_key is empty".into()));
        }
        if let Some(task) = &self.task {
            if task.task_id.trim().is_empty() {
                return Err(AppError::InvalidDescriptor("task_id is empty".into()));
            }
            if task.poll_interval_s == 0 {
                return Err(AppError::InvalidDescriptor(
                    "poll_interval_s must be positive".into(),
                ));
            }
            if task.timeout_s > MAX_TASK_TIMEOUT_S {
                return Err(AppError::InvalidDescriptor(format!(
                    "timeout_s {} exceeds {MAX_TASK_TIMEOUT_S}",
                    task.timeout_s
                )));
            }
            if task.poll_interval_s > MAX_TASK_TIMEOUT_S {
                return Err(AppError::InvalidDescriptor(format!(
                    "poll_interval_s {} exceeds {MAX_TASK_TIMEOUT_S}",
                    task.poll_interval_s
                )));
            }
            if task.deadline().is_none() {
                return Err(AppError::InvalidDescriptor(format!(
                    "deadline of task {} is out of range",
                    task.task_id
                )));
            }
        }
        Ok(())
    }

    /// The asynchronous extension, required for poll activations.
    pub fn async_task(&self) -> Result<&AsyncTask, AppError> {
        self.task.as_ref().ok_or_else(|| {
            AppError::InvalidDescriptor(format!(
                "job for '{}' has no async task attached",
                self.model_key
            ))
        })
    }

    pub fn with_task(mut self, task: AsyncTask) -> Self {
        self.task = Some(task);
        self
    }

    /// Stable identity of the job for terminal bookkeeping.
    ///
    /// Prefers the remote task id, which is unique per created generation.
    pub fn terminal_marker(&self) -> String {
        match (&self.task, self.job_id) {
            (Some(task), _) => format!("task:{}:{}", self.model_key, task.task_id),
            (None, Some(job_id)) => format!("job:{job_id}"),
            (None, None) => format!("user:{}:{}", self.user_id, self.model_key),
        }
    }
}

/// A finished generation ready for delivery.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    /// File extension derived from the media subtype (`image/png` -> `png`).
    pub fn extension(&self) -> &str {
        self.media_type
            .rsplit('/')
            .next()
            .filter(|ext| !ext.is_empty())
            .unwrap_or("bin")
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Remote task created by an asynchronous provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: String,
    pub poll_after_s: u64,
    pub timeout_s: u64,
}

/// Result of one provider invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum InvokeOutcome {
    Artifact(Artifact),
    Task(TaskHandle),
    Rejected { reason: String },
}

impl InvokeOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Result of one poll of a remote task.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Succeeded { result: String },
    Failed { reason: String },
    Pending { progress: Option<f64> },
}

/// Status values understood by the external tracking system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Processing,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// States of an in-flight asynchronous job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PollState {
    Pending,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RetryScheduled => "retry-scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PollState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retry-scheduled" => Ok(Self::RetryScheduled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown poll state '{other}'")),
        }
    }
}
