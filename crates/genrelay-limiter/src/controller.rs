//! Distributed admission control: a global rate ceiling and a global
//! concurrency ceiling per admission key, shared by every worker process.
//!
//! `acquire` repeats the store's atomic admission attempt on a fixed
//! interval until it is admitted or the wait budget runs out. The returned
//! [`AdmissionPermit`] must be handed back to [`AdmissionController::release`]
//! exactly once; release consumes the permit. A permit dropped without
//! release (a cancelled caller) frees its slot from a spawned task.

use anyhow::Result;
use genrelay_core::{AppError, Clock, DenyReason, SystemClock, unix_seconds};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{AdmitDecision, AdmitRequest, SharedStore, SlotSnapshot};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_LEASE: Duration = Duration::from_secs(10 * 60);

/// Ceilings for one admission key. `None` disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rpm: Option<u32>,
    pub concurrency: Option<u32>,
    pub window: Duration,
}

impl Limits {
    pub fn new(rpm: Option<u32>, concurrency: Option<u32>, window: Duration) -> Self {
        Self {
            rpm: rpm.filter(|v| *v > 0),
            concurrency: concurrency.filter(|v| *v > 0),
            window,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None, Duration::from_secs(60))
    }
}

/// Proof of admission. Returned to the controller to free the slot.
#[must_use = "an admission permit must be released"]
pub struct AdmissionPermit {
    key: String,
    holds_slot: bool,
    released: bool,
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.key)
            .field("holds_slot", &self.holds_slot)
            .finish_non_exhaustive()
    }
}

impl AdmissionPermit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the permit occupies a concurrency slot (concurrency-limited key).
    pub fn holds_slot(&self) -> bool {
        self.holds_slot
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.holds_slot || self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = %self.key,
                "admission permit dropped outside a runtime; slot held until lease expiry"
            );
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        debug!(key = %key, "admission permit dropped without release; releasing in background");
        handle.spawn(async move {
            if let Err(e) = store.release(&key).await {
                warn!(key = %key, error = %e, "background slot release failed; held until lease expiry");
            }
        });
    }
}

pub struct AdmissionController {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    lease: Duration,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("poll_interval", &self.poll_interval)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One atomic admission attempt, no waiting.
    pub async fn try_acquire(&self, key: &str, limits: &Limits) -> Result<Option<AdmissionPermit>> {
        match self.attempt(key, limits).await? {
            AdmitDecision::Admitted => Ok(Some(self.permit(key, limits))),
            AdmitDecision::Denied(_) => Ok(None),
        }
    }

    /// Wait for admission for up to `max_wait`.
    ///
    /// Fails with [`AppError::BudgetExceeded`] once the wait budget is spent;
    /// the failure comes no earlier than `max_wait` and no later than one
    /// poll interval after it. Store faults propagate immediately.
    pub async fn acquire(
        &self,
        key: &str,
        limits: &Limits,
        max_wait: Duration,
    ) -> Result<AdmissionPermit> {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let reason: DenyReason = match self.attempt(key, limits).await? {
                AdmitDecision::Admitted => {
                    if attempts > 1 {
                        debug!(key, attempts, waited_ms = start.elapsed().as_millis() as u64, "admitted after wait");
                    }
                    return Ok(self.permit(key, limits));
                }
                AdmitDecision::Denied(reason) => reason,
            };

            let waited = start.elapsed();
            if waited >= max_wait {
                warn!(key, %reason, attempts, "admission budget exhausted");
                return Err(AppError::BudgetExceeded {
                    key: key.to_string(),
                    reason,
                    waited_ms: waited.as_millis() as u64,
                }
                .into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Return a permit. Consuming the permit makes a second release impossible.
    pub async fn release(&self, mut permit: AdmissionPermit) -> Result<()> {
        permit.released = true;
        if permit.holds_slot {
            self.store.release(&permit.key).await?;
            debug!(key = %permit.key, "admission slot released");
        }
        Ok(())
    }

    /// Raw idempotent release by key, for operators clearing a stuck slot.
    pub async fn release_key(&self, key: &str) -> Result<()> {
        self.store.release(key).await
    }

    pub async fn snapshot(&self, key: &str, window: Duration) -> Result<SlotSnapshot> {
        let now = unix_seconds(self.clock.now());
        self.store.snapshot(key, now, window.as_secs()).await
    }

    async fn attempt(&self, key: &str, limits: &Limits) -> Result<AdmitDecision> {
        let request = AdmitRequest {
            key: key.to_string(),
            now: unix_seconds(self.clock.now()),
            window_s: limits.window.as_secs(),
            rpm: limits.rpm,
            concurrency: limits.concurrency,
            lease: self.lease,
        };
        self.store.try_admit(&request).await
    }

    fn permit(&self, key: &str, limits: &Limits) -> AdmissionPermit {
        AdmissionPermit {
            key: key.to_string(),
            holds_slot: limits.concurrency.is_some(),
            released: false,
            store: self.store.clone(),
        }
    }
}
