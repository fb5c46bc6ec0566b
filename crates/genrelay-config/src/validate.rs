use anyhow::{Result, bail};
use genrelay_core::MAX_TASK_TIMEOUT_S;
use tracing::warn;

use crate::config::Config;

/// Validate a loaded configuration.
/// Returns Ok(()) if valid, or Err with a descriptive message.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_queue(config)?;
    validate_admission(config)?;
    validate_policies(config)?;
    validate_providers(config)?;
    warn_models_without_provider(config);
    Ok(())
}

fn validate_queue(config: &Config) -> Result<()> {
    let queue = &config.queue;
    if queue.name.trim().is_empty() {
        bail!("queue.name cannot be empty");
    }
    if queue.max_jobs == 0 {
        bail!("queue.max_jobs must be > 0 (got 0)");
    }
    if queue.max_tries == 0 {
        bail!("queue.max_tries must be > 0 (got 0)");
    }
    if queue.idle_poll_ms == 0 {
        bail!("queue.idle_poll_ms must be > 0 (got 0)");
    }
    if queue.visibility_timeout_seconds <= queue.job_timeout_seconds {
        bail!(
            "queue.visibility_timeout_seconds ({}) must exceed queue.job_timeout_seconds ({}), \
             otherwise running activations are redelivered",
            queue.visibility_timeout_seconds,
            queue.job_timeout_seconds
        );
    }
    Ok(())
}

fn validate_admission(config: &Config) -> Result<()> {
    let admission = &config.admission;
    if admission.poll_interval_ms == 0 {
        bail!("admission.poll_interval_ms must be > 0 (got 0)");
    }
    if admission.lease_seconds == 0 {
        bail!("admission.lease_seconds must be > 0 (got 0)");
    }
    if admission.terminal_marker_ttl_seconds == 0 {
        bail!("admission.terminal_marker_ttl_seconds must be > 0 (got 0)");
    }
    Ok(())
}

fn validate_policies(config: &Config) -> Result<()> {
    for (model, policy) in config.policies.iter() {
        if policy.window_seconds == 0 {
            bail!("policies.{model}.window_seconds must be > 0 (got 0)");
        }
        if policy.timeout_seconds == 0 {
            bail!("policies.{model}.timeout_seconds must be > 0 (got 0)");
        }
        if let Some(alias) = &policy.limit_key {
            if alias.trim().is_empty() {
                bail!("policies.{model}.limit_key cannot be empty");
            }
        }
        // The worker cancels an activation at job_timeout; admission wait
        // plus the invocation must fit inside it.
        let budget = policy
            .timeout_seconds
            .saturating_add(config.admission.max_wait_seconds);
        if budget >= config.queue.job_timeout_seconds {
            bail!(
                "policies.{model}.timeout_seconds ({}) + admission.max_wait_seconds ({}) \
                 must be below queue.job_timeout_seconds ({})",
                policy.timeout_seconds,
                config.admission.max_wait_seconds,
                config.queue.job_timeout_seconds
            );
        }
    }
    Ok(())
}

fn validate_providers(config: &Config) -> Result<()> {
    for (model, provider) in &config.providers {
        if !config.policies.contains(model) {
            bail!("providers.{model} has no matching [policies.{model}] entry");
        }
        if provider.api_key_env.trim().is_empty() {
            bail!("providers.{model}.api_key_env cannot be empty");
        }
        match &provider.secret_key_env {
            Some(var) if var.trim().is_empty() => {
                bail!("providers.{model}.secret_key_env cannot be empty");
            }
            None if provider.kind.needs_secret_key() => {
                bail!("providers.{model}.secret_key_env is required for kind '{}'", provider.kind);
            }
            _ => {}
        }
        if provider.poll_interval_seconds == Some(0) {
            bail!("providers.{model}.poll_interval_seconds must be > 0 (got 0)");
        }
        if let Some(timeout) = provider.task_timeout_seconds {
            if timeout == 0 || timeout > MAX_TASK_TIMEOUT_S {
                bail!(
                    "providers.{model}.task_timeout_seconds must be in 1..={MAX_TASK_TIMEOUT_S} (got {timeout})"
                );
            }
        }
        if provider.poll_interval_seconds.is_some_and(|s| s > MAX_TASK_TIMEOUT_S) {
            bail!("providers.{model}.poll_interval_seconds must be <= {MAX_TASK_TIMEOUT_S}");
        }
        if provider.download_concurrency == Some(0) {
            bail!("providers.{model}.download_concurrency must be > 0 (got 0)");
        }
    }
    Ok(())
}

fn warn_models_without_provider(config: &Config) {
    for (model, _) in config.policies.iter() {
        if !config.providers.contains_key(model) {
            warn!(model = %model, "policy has no provider binding; jobs for it will be rejected");
        }
    }
}
