//! The shared-store contract behind admission control.
//!
//! Every mutation of admission state happens inside one store operation:
//! `try_admit` checks the holder count and the rate window and commits the
//! reservation in the same atomic step, so two processes can never both
//! observe a free slot and both take it.

use anyhow::Result;
use async_trait::async_trait;
use genrelay_core::DenyReason;
use std::time::Duration;

/// Arguments of one atomic admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmitRequest {
    /// Admission bucket (policy `limit_key` or model key).
    pub key: String,
    /// Wall-clock seconds since the epoch at the time of the attempt.
    pub now: f64,
    pub window_s: u64,
    /// `None` disables the rate check.
    pub rpm: Option<u32>,
    /// `None` disables the concurrency check.
    pub concurrency: Option<u32>,
    /// Expiry refreshed on the holder counter when admitted.
    pub lease: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted,
    Denied(DenyReason),
}

impl AdmitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Read-only view of one admission bucket, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub holders: u64,
    pub window_entries: u64,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check both ceilings and, only if both pass, commit the reservation.
    async fn try_admit(&self, request: &AdmitRequest) -> Result<AdmitDecision>;

    /// Decrement the holder counter if it is above zero.
    async fn release(&self, key: &str) -> Result<()>;

    /// Current holders and live rate-window entries, without mutating.
    async fn snapshot(&self, key: &str, now: f64, window_s: u64) -> Result<SlotSnapshot>;

    /// Terminal state recorded for a job, if any.
    async fn terminal_state(&self, marker: &str) -> Result<Option<String>>;

    /// Record a terminal state if none is recorded yet.
    ///
    /// Returns `true` when this call recorded it; `false` when another
    /// activation got there first.
    async fn claim_terminal(&self, marker: &str, state: &str, ttl: Duration) -> Result<bool>;
}
