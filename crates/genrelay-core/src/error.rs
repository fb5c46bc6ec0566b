use crate::types::DenyReason;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Budget wait exceeded for '{key}' after {waited_ms} ms ({reason})")]
    BudgetExceeded {
        key: String,
        reason: DenyReason,
        waited_ms: u64,
    },

    #[error("Upstream rejected the request: {0}")]
    UpstreamRejected(String),

    #[error("Transport fault talking to '{endpoint}': {message}")]
    TransportFault { endpoint: String, message: String },

    #[error("Timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("Unknown model '{0}': no policy configured")]
    UnknownModel(String),

    #[error("No provider registered for model '{0}'")]
    NoProvider(String),

    #[error("Provider for model '{0}' does not support polling")]
    PollingUnsupported(String),

    #[error("Invalid job descriptor: {0}")]
    InvalidDescriptor(String),
}

impl AppError {
    /// Whether the error ends the job for good (as opposed to a fault the
    /// queue layer may retry).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TransportFault { .. })
    }
}
