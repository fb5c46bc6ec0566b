use anyhow::Result;
use async_trait::async_trait;
use genrelay_core::{AppError, GenerationParams, InvokeOutcome, PollOutcome};

/// Rejection reason for `is_test` jobs, which never reach upstream.
pub const TEST_JOB_REASON: &str = "Fake error";

/// One upstream generation service.
///
/// `invoke` either finishes synchronously with an artifact, creates a
/// remote task to be polled, or reports an upstream rejection. Transport
/// faults are returned as `Err`.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, params: &GenerationParams) -> Result<InvokeOutcome>;

    /// Whether `poll` is implemented. Registries only hand out pollers
    /// for providers that return `true`.
    fn supports_polling(&self) -> bool {
        false
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome> {
        let _ = task_id;
        Err(AppError::PollingUnsupported(self.name().to_string()).into())
    }
}
