//! Process-local [`JobQueue`] following a [`Clock`].

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genrelay_core::{Clock, JobDescriptor, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use ulid::Ulid;

use crate::JobQueue;
use crate::activation::{Activation, ActivationKind};

/// A queued activation and when it becomes ready.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingActivation {
    pub activation: Activation,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    ready: Vec<PendingActivation>,
    in_flight: HashMap<Ulid, (DateTime<Utc>, Activation)>,
}

pub struct InMemoryQueue {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            visibility_timeout: Duration::from_secs(960),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory queue state poisoned"))
    }

    /// Everything not yet claimed, ordered by due time.
    pub fn pending(&self) -> Vec<PendingActivation> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = state.ready.clone();
        pending.sort_by_key(|p| p.due);
        pending
    }

    /// Pending activations of one kind with their delay from now.
    pub fn pending_delays(&self, kind: ActivationKind) -> Vec<Duration> {
        let now = self.clock.now();
        self.pending()
            .into_iter()
            .filter(|p| p.activation.kind == kind)
            .map(|p| (p.due - now).to_std().unwrap_or(Duration::ZERO))
            .collect()
    }

    pub fn in_flight_len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.len()
    }

    fn push(&self, activation: Activation, delay: Duration) -> Result<()> {
        let due = self.clock.now() + to_chrono(delay);
        self.lock()?.ready.push(PendingActivation { activation, due });
        Ok(())
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue_activation(
        &self,
        kind: ActivationKind,
        descriptor: JobDescriptor,
        delay: Duration,
    ) -> Result<Ulid> {
        let activation = Activation::new(kind, descriptor);
        let id = activation.id;
        self.push(activation, delay)?;
        Ok(id)
    }

    async fn next_ready(&self) -> Result<Option<Activation>> {
        let now = self.clock.now();
        let deadline = now + to_chrono(self.visibility_timeout);
        let mut state = self.lock()?;

        let expired: Vec<Ulid> = state
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((_, activation)) = state.in_flight.remove(&id) {
                warn!(id = %id, kind = %activation.kind, "visibility timeout expired; redelivering");
                state.ready.push(PendingActivation { activation, due: now });
            }
        }

        let next = state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= now)
            .min_by_key(|(_, p)| p.due)
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            return Ok(None);
        };
        let pending = state.ready.remove(idx);
        state
            .in_flight
            .insert(pending.activation.id, (deadline, pending.activation.clone()));
        Ok(Some(pending.activation))
    }

    async fn ack(&self, activation: &Activation) -> Result<()> {
        self.lock()?.in_flight.remove(&activation.id);
        Ok(())
    }

    async fn retry(&self, mut activation: Activation, delay: Duration) -> Result<()> {
        self.lock()?.in_flight.remove(&activation.id);
        activation.attempt += 1;
        self.push(activation, delay)
    }
}
