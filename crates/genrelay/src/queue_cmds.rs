//! Operator commands: submit a job, inspect policies and admission slots.

use anyhow::{Context, Result};
use genrelay_config::{Config, PolicyTable};
use genrelay_core::JobDescriptor;
use genrelay_limiter::{AdmissionController, RedisStore};
use genrelay_queue::{ActivationKind, JobQueue, RedisQueue};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_WINDOW_SECONDS: u64 = 60;

pub(crate) fn read_descriptor(path: &Path) -> Result<JobDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job descriptor: {}", path.display()))?;
    let descriptor: JobDescriptor = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job descriptor: {}", path.display()))?;
    descriptor.validate()?;
    Ok(descriptor)
}

pub(crate) async fn handle_enqueue(config: &Config, file: &Path, delay: u64) -> Result<()> {
    let descriptor = read_descriptor(file)?;
    let model = descriptor.model_key.clone();
    if !config.policies.contains(&model) {
        tracing::warn!(model = %model, "no policy for model; the worker will reject this job");
    }
    let queue = RedisQueue::connect(
        &config.store.redis_url,
        config.queue.name.clone(),
        config.queue.visibility_timeout(),
    )
    .await?;
    let id = queue
        .enqueue_activation(
            ActivationKind::Generate,
            descriptor,
            Duration::from_secs(delay),
        )
        .await?;
    println!("{id}");
    Ok(())
}

pub(crate) fn handle_policies(config: &Config) {
    print!("{}", render_policies(&config.policies));
}

pub(crate) async fn handle_slots(config: &Config, key: &str, window: Option<u64>) -> Result<()> {
    let window = Duration::from_secs(window.unwrap_or_else(|| window_for_key(&config.policies, key)));
    let store = RedisStore::connect(&config.store.redis_url, config.store.key_prefix.clone()).await?;
    let controller = AdmissionController::new(Arc::new(store));
    let snapshot = controller.snapshot(key, window).await?;
    println!(
        "{key}: holders={} requests_in_last_{}s={}",
        snapshot.holders,
        window.as_secs(),
        snapshot.window_entries
    );
    Ok(())
}

/// Rate window of the first policy admitting through `key`.
fn window_for_key(policies: &PolicyTable, key: &str) -> u64 {
    policies
        .iter()
        .find(|(model, _)| policies.admission_key(model) == Some(key))
        .map(|(_, policy)| policy.window_seconds)
        .unwrap_or(DEFAULT_WINDOW_SECONDS)
}

fn limit(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub(crate) fn render_policies(policies: &PolicyTable) -> String {
    let mut out = format!(
        "{:<24} {:<24} {:>6} {:>11} {:>7} {:>8}\n",
        "MODEL", "ADMISSION KEY", "RPM", "CONCURRENCY", "WINDOW", "TIMEOUT"
    );
    for (model, policy) in policies.iter() {
        let key = policies.admission_key(model).unwrap_or(model);
        out.push_str(&format!(
            "{:<24} {:<24} {:>6} {:>11} {:>6}s {:>7}s\n",
            model,
            key,
            limit(policy.rpm_limit()),
            limit(policy.concurrency_limit()),
            policy.window_seconds,
            policy.timeout_seconds
        ));
    }
    out
}
