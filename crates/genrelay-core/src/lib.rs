//! Shared types, error taxonomy and clock for the genrelay workspace.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, unix_seconds};
pub use error::AppError;
pub use types::{
    Artifact, AsyncTask, DenyReason, GenerationParams, InvokeOutcome, JobDescriptor, JobId,
    JobStatus, MAX_TASK_TIMEOUT_S, MessageId, PollOutcome, PollState, TaskHandle, UserId,
};
