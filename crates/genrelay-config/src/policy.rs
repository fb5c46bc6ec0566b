//! Per-model admission limits.
//!
//! A policy is pure data: the limiter receives the resolved numbers and
//! never sees model keys. Several models can share one admission bucket
//! by pointing `limit_key` at the same alias.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPolicy {
    /// Requests allowed per window. Absent or non-positive = unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<i64>,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Simultaneously admitted calls. Absent or non-positive = unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i64>,
    /// Hard ceiling on one provider invocation.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_key: Option<String>,
}

fn default_window_seconds() -> u64 {
    DEFAULT_WINDOW_SECONDS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for ModelPolicy {
    fn default() -> Self {
        Self {
            rpm: None,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            concurrency: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            limit_key: None,
        }
    }
}

impl ModelPolicy {
    pub fn rpm_limit(&self) -> Option<u32> {
        positive(self.rpm)
    }

    pub fn concurrency_limit(&self) -> Option<u32> {
        positive(self.concurrency)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rpm_limit().is_none() && self.concurrency_limit().is_none()
    }
}

fn positive(value: Option<i64>) -> Option<u32> {
    value
        .filter(|v| *v > 0)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Static model key -> policy mapping, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: BTreeMap<String, ModelPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, model_key: impl Into<String>, policy: ModelPolicy) -> Self {
        self.policies.insert(model_key.into(), policy);
        self
    }

    pub fn get(&self, model_key: &str) -> Option<&ModelPolicy> {
        self.policies.get(model_key)
    }

    pub fn contains(&self, model_key: &str) -> bool {
        self.policies.contains_key(model_key)
    }

    /// Admission bucket for a model: its `limit_key` alias, else the key itself.
    pub fn admission_key<'a>(&'a self, model_key: &'a str) -> Option<&'a str> {
        let policy = self.policies.get(model_key)?;
        Some(policy.limit_key.as_deref().unwrap_or(model_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelPolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
