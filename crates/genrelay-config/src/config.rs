//! Worker configuration (`~/.config/genrelay/config.toml`).
//!
//! One file holds everything a worker process needs: the shared store,
//! the queue, admission tuning, notification endpoints, the policy table
//! and the provider bindings. Secrets are referenced by environment
//! variable name only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::PolicyTable;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "GENRELAY_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub policies: PolicyTable,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Prefix for every key the limiter writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    "lim".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Activations run concurrently inside one worker process.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Ceiling on one activation, including admission wait.
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    /// Attempts per activation before it is dropped.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    /// Sleep between empty polls of the queue.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// A claimed activation not acknowledged within this time is redelivered.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,
}

fn default_queue_name() -> String {
    "q:generate".to_string()
}

fn default_max_jobs() -> usize {
    50
}

fn default_job_timeout_seconds() -> u64 {
    900
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_delay_seconds() -> u64 {
    5
}

fn default_idle_poll_ms() -> u64 {
    500
}

fn default_visibility_timeout_seconds() -> u64 {
    960
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_jobs: default_max_jobs(),
            job_timeout_seconds: default_job_timeout_seconds(),
            max_tries: default_max_tries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            idle_poll_ms: default_idle_poll_ms(),
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
        }
    }
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Give up waiting for a slot after this long and tell the user to retry.
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease on the holder counter; reclaims slots of crashed holders.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// How long a finished job is remembered to absorb duplicate activations.
    #[serde(default = "default_terminal_marker_ttl_seconds")]
    pub terminal_marker_ttl_seconds: u64,
}

fn default_max_wait_seconds() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lease_seconds() -> u64 {
    600
}

fn default_terminal_marker_ttl_seconds() -> u64 {
    24 * 60 * 60
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_seconds: default_lease_seconds(),
            terminal_marker_ttl_seconds: default_terminal_marker_ttl_seconds(),
        }
    }
}

impl AdmissionConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn terminal_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.terminal_marker_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    /// Caption attached to delivered files.
    #[serde(default)]
    pub artifact_caption: String,
    /// Delivered files are named `<basename>.<ext>`.
    #[serde(default = "default_artifact_basename")]
    pub artifact_basename: String,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_bot_token_env() -> String {
    "BOT_TOKEN".to_string()
}

fn default_artifact_basename() -> String {
    "generation".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            bot_token_env: default_bot_token_env(),
            artifact_caption: String::new(),
            artifact_basename: default_artifact_basename(),
        }
    }
}

/// External job-tracking callback. Absent = status reports are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub base_url: String,
    #[serde(default = "default_status_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_results_path")]
    pub results_path: String,
}

fn default_status_api_key_env() -> String {
    "SERVER_KEY".to_string()
}

fn default_auth_header() -> String {
    "x-server-key".to_string()
}

fn default_status_path() -> String {
    "/api/job-status".to_string()
}

fn default_results_path() -> String {
    "/api/job-results".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Gemini image models; synchronous, returns inline bytes.
    GeminiImage,
    /// Runway task API; create then poll.
    Runway,
    /// Kie task API; create then poll.
    Kie,
    /// Kling text-to-video; signed-token auth, create then poll.
    #[serde(rename = "kling-text2video")]
    KlingText2Video,
    /// Kling image-to-video (first frame plus optional tail frame).
    #[serde(rename = "kling-image2video")]
    KlingImage2Video,
    /// Kling motion control from a reference image.
    KlingMotionControl,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeminiImage => "gemini-image",
            Self::Runway => "runway",
            Self::Kie => "kie",
            Self::KlingText2Video => "kling-text2video",
            Self::KlingImage2Video => "kling-image2video",
            Self::KlingMotionControl => "kling-motion-control",
        }
    }

    /// Kinds that sign requests with a second secret (`secret_key_env`).
    pub fn needs_secret_key(&self) -> bool {
        matches!(
            self,
            Self::KlingText2Video | Self::KlingImage2Video | Self::KlingMotionControl
        )
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Binds a model key to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Upstream model name, when the adapter needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Override of the adapter's default API base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub api_key_env: String,
    /// Signing secret for kinds with two-part credentials (Kling).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_env: Option<String>,
    /// Suggested delay between polls for asynchronous adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<u64>,
    /// Overall lifetime of a remote task for asynchronous adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_seconds: Option<u64>,
    /// Parallel reference-image downloads per process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_concurrency: Option<usize>,
}

impl Config {
    /// Load configuration.
    ///
    /// Lookup order: `explicit` path -> `$GENRELAY_CONFIG` -> default path.
    /// An explicit or env-provided path must exist; a missing default file
    /// yields `Config::default()`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty());
        match resolve_path(explicit, env_path.as_deref()) {
            Some(path) => Self::load_from(&path),
            None => {
                let path = match Self::config_path() {
                    Ok(p) => p,
                    Err(_) => return Ok(Self::default()),
                };
                if !path.exists() {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    return Ok(Self::default());
                }
                Self::load_from(&path)
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Path to the default config file: `~/.config/genrelay/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "genrelay")
            .context("Failed to determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Generate a commented config template.
    pub fn default_template() -> String {
        r#"# genrelay worker configuration
# Location: ~/.config/genrelay/config.toml (override with --config or GENRELAY_CONFIG)
#
# Secrets are never written here; each section names the environment
# variable that holds them.

[store]
redis_url = "redis://127.0.0.1:6379/0"
key_prefix = "lim"

[queue]
name = "q:generate"
max_jobs = 50               # activations in parallel per process
job_timeout_seconds = 900
max_tries = 5
retry_delay_seconds = 5
idle_poll_ms = 500
visibility_timeout_seconds = 960

[admission]
max_wait_seconds = 120      # then the user is told to retry later
poll_interval_ms = 250
lease_seconds = 600         # reclaims slots of crashed holders
terminal_marker_ttl_seconds = 86400

[notify]
bot_token_env = "BOT_TOKEN"
artifact_caption = ""
artifact_basename = "generation"

# [status]
# base_url = "https://tracker.example.com"
# api_key_env = "SERVER_KEY"

[policies.gemini_2_5_image]
rpm = 500
concurrency = 50

[policies.gemini_3_image]
rpm = 20
concurrency = 4

# Two variants sharing one upstream pool:
# [policies.runway_t2v]
# concurrency = 2
# limit_key = "runway"
# [policies.runway_i2v]
# concurrency = 2
# limit_key = "runway"

[providers.gemini_2_5_image]
kind = "gemini-image"
model = "gemini-2.5-flash-image"
api_key_env = "GEMINI_API_KEY"

[providers.gemini_3_image]
kind = "gemini-image"
model = "gemini-3-pro-image-preview"
api_key_env = "GEMINI_API_KEY"
download_concurrency = 20

# Kling video; api_key_env holds the access key.
# [policies.kling_i2v]
# concurrency = 2
# limit_key = "kling"
# [providers.kling_i2v]
# kind = "kling-image2video"
# api_key_env = "KLING_ACCESS_KEY"
# secret_key_env = "KLING_SECRET_KEY"
# task_timeout_seconds = 900
"#
        .to_string()
    }

    /// Save the default template, creating directories as needed.
    /// Returns the path where the file was written.
    pub fn save_default_template(path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&path, Self::default_template())
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(path)
    }
}

/// Pick the config path from an explicit flag or the env override.
pub fn resolve_path(explicit: Option<&Path>, env_value: Option<&str>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.map(PathBuf::from))
}

/// Read a secret from the environment variable named in the config.
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("environment variable {var} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.max_jobs, 50);
        assert_eq!(config.queue.max_tries, 5);
        assert_eq!(config.admission.max_wait_seconds, 120);
        assert_eq!(config.admission.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.admission.lease(), Duration::from_secs(600));
        assert_eq!(config.store.key_prefix, "lim");
        assert!(config.policies.is_empty());
        assert!(config.status.is_none());
    }

    #[test]
    fn test_template_parses() {
        let config = Config::from_toml_str(&Config::default_template()).unwrap();
        assert_eq!(config.policies.len(), 2);
        let gemini3 = config.policies.get("gemini_3_image").unwrap();
        assert_eq!(gemini3.rpm_limit(), Some(20));
        assert_eq!(gemini3.concurrency_limit(), Some(4));
        let provider = config.providers.get("gemini_3_image").unwrap();
        assert_eq!(provider.kind, ProviderKind::GeminiImage);
        assert_eq!(provider.download_concurrency, Some(20));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config = Config::from_toml_str(
            r#"
            [queue]
            max_jobs = 4

            [status]
            base_url = "https://tracker.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_jobs, 4);
        assert_eq!(config.queue.job_timeout_seconds, 900);
        let status = config.status.unwrap();
        assert_eq!(status.status_path, "/api/job-status");
        assert_eq!(status.api_key_env, "SERVER_KEY");
    }

    #[test]
    fn test_kling_kinds_parse_with_secret() {
        let config = Config::from_toml_str(
            r#"
            [providers.kling_t2v]
            kind = "kling-text2video"
            api_key_env = "KLING_ACCESS_KEY"
            secret_key_env = "KLING_SECRET_KEY"

            [providers.kling_motion]
            kind = "kling-motion-control"
            api_key_env = "KLING_ACCESS_KEY"
            secret_key_env = "KLING_SECRET_KEY"
            "#,
        )
        .unwrap();
        let t2v = config.providers.get("kling_t2v").unwrap();
        assert_eq!(t2v.kind, ProviderKind::KlingText2Video);
        assert_eq!(t2v.kind.as_str(), "kling-text2video");
        assert_eq!(t2v.secret_key_env.as_deref(), Some("KLING_SECRET_KEY"));
        assert!(t2v.kind.needs_secret_key());
        let motion = config.providers.get("kling_motion").unwrap();
        assert_eq!(motion.kind, ProviderKind::KlingMotionControl);
        assert_eq!(motion.kind.to_string(), "kling-motion-control");
        assert!(!ProviderKind::Runway.needs_secret_key());
    }

    #[test]
    fn test_unknown_provider_kind_fails() {
        let result = Config::from_toml_str(
            r#"
            [providers.flux]
            kind = "flux"
            api_key_env = "FLUX_KEY"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[policies.runway]\nconcurrency = 1\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(
            config.policies.get("runway").unwrap().concurrency_limit(),
            Some(1)
        );
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let dir = tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config"));
    }

    #[test]
    fn test_load_reports_parse_location() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[queue\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_resolve_path_precedence() {
        let explicit = PathBuf::from("/etc/genrelay.toml");
        assert_eq!(
            resolve_path(Some(&explicit), Some("/tmp/env.toml")),
            Some(explicit.clone())
        );
        assert_eq!(
            resolve_path(None, Some("/tmp/env.toml")),
            Some(PathBuf::from("/tmp/env.toml"))
        );
        assert_eq!(resolve_path(None, None), None);
    }

    #[test]
    fn test_save_default_template_creates_parents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("config.toml");
        let written = Config::save_default_template(Some(&target)).unwrap();
        assert_eq!(written, target);
        let loaded = Config::load_from(&target).unwrap();
        assert_eq!(loaded.queue.name, "q:generate");
    }

    #[test]
    fn test_serialized_config_reloads() {
        let config = Config::from_toml_str(&Config::default_template()).unwrap();
        let text = config.to_toml_string().unwrap();
        let again = Config::from_toml_str(&text).unwrap();
        assert_eq!(again.policies, config.policies);
    }

    #[test]
    fn test_secret_from_env_missing() {
        let err = secret_from_env("GENRELAY_TEST_SURELY_UNSET_VAR").unwrap_err();
        assert!(err.to_string().contains("GENRELAY_TEST_SURELY_UNSET_VAR"));
    }
}
