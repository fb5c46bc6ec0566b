//! Process-local [`SharedStore`].
//!
//! Implements the same protocol as the Redis store with one mutex as the
//! atomic section. Useful for a single worker process and for tests; it
//! coordinates nothing across processes.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use genrelay_core::{Clock, DenyReason, SystemClock, unix_seconds};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::store::{AdmitDecision, AdmitRequest, SharedStore, SlotSnapshot};

#[derive(Debug, Default)]
struct Holders {
    count: u64,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct Window {
    /// (timestamp, sequence) pairs; the sequence keeps equal timestamps distinct.
    entries: Vec<(f64, u64)>,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct State {
    holders: HashMap<String, Holders>,
    windows: HashMap<String, Window>,
    markers: HashMap<String, (String, f64)>,
    seq: u64,
}

impl State {
    fn live_holders(&mut self, key: &str, now: f64) -> u64 {
        match self.holders.get(key) {
            Some(h) if h.expires_at > now => h.count,
            Some(_) => {
                self.holders.remove(key);
                0
            }
            None => 0,
        }
    }

    fn live_window(&mut self, key: &str, now: f64) -> Option<&mut Window> {
        if self.windows.get(key).is_some_and(|w| w.expires_at <= now) {
            self.windows.remove(key);
        }
        self.windows.get_mut(key)
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose lease and marker expiry follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory admission state poisoned"))
    }

    fn now(&self) -> f64 {
        unix_seconds(self.clock.now())
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn try_admit(&self, request: &AdmitRequest) -> Result<AdmitDecision> {
        let mut state = self.lock()?;
        let now = request.now;
        let key = request.key.as_str();

        if let Some(limit) = request.concurrency {
            if state.live_holders(key, now) >= u64::from(limit) {
                return Ok(AdmitDecision::Denied(DenyReason::Concurrency));
            }
        }

        if let Some(limit) = request.rpm {
            let cutoff = now - request.window_s as f64;
            let count = match state.live_window(key, now) {
                Some(window) => {
                    window.entries.retain(|(ts, _)| *ts > cutoff);
                    window.entries.len()
                }
                None => 0,
            };
            if count >= limit as usize {
                return Ok(AdmitDecision::Denied(DenyReason::Rate));
            }
        }

        if request.concurrency.is_some() {
            let live = state.live_holders(key, now);
            let holders = state.holders.entry(key.to_string()).or_default();
            holders.count = live + 1;
            holders.expires_at = now + request.lease.as_secs_f64();
        }

        if request.rpm.is_some() {
            state.seq += 1;
            let seq = state.seq;
            let window = state.windows.entry(key.to_string()).or_default();
            window.entries.push((now, seq));
            window.expires_at = now + (request.window_s as f64 * 2.0).ceil();
        }

        Ok(AdmitDecision::Admitted)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let now = self.now();
        let mut state = self.lock()?;
        if state.live_holders(key, now) > 0 {
            if let Some(holders) = state.holders.get_mut(key) {
                holders.count -= 1;
            }
        }
        Ok(())
    }

    async fn snapshot(&self, key: &str, now: f64, window_s: u64) -> Result<SlotSnapshot> {
        let mut state = self.lock()?;
        let holders = state.live_holders(key, now);
        let cutoff = now - window_s as f64;
        let window_entries = state
            .live_window(key, now)
            .map(|w| w.entries.iter().filter(|(ts, _)| *ts > cutoff).count() as u64)
            .unwrap_or(0);
        Ok(SlotSnapshot {
            holders,
            window_entries,
        })
    }

    async fn terminal_state(&self, marker: &str) -> Result<Option<String>> {
        let now = self.now();
        let mut state = self.lock()?;
        match state.markers.get(marker) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                state.markers.remove(marker);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn claim_terminal(&self, marker: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let mut state = self.lock()?;
        if let Some((_, expires_at)) = state.markers.get(marker) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.markers.insert(
            marker.to_string(),
            (value.to_string(), now + ttl.as_secs_f64()),
        );
        Ok(true)
    }
}
