//! Kling video API. Every request carries a short-lived HS256 token signed
//! with the account's secret key; creation returns `{data: {task_id}}` and
//! the task is polled under the same path it was created on.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use genrelay_core::{GenerationParams, InvokeOutcome, PollOutcome, TaskHandle};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::error;

use crate::http::{send_json, trim_base};
use crate::provider::{GenerationProvider, TEST_JOB_REASON};

pub const DEFAULT_BASE_URL: &str = "https://api-singapore.klingai.com";
pub const DEFAULT_MODEL: &str = "kling-v2-6";
pub const DEFAULT_POLL_AFTER_S: u64 = 5;
pub const DEFAULT_TASK_TIMEOUT_S: u64 = 900;
const DEFAULT_MODE: &str = "pro";
const DEFAULT_DURATION: &str = "5";
const TOKEN_TTL_S: i64 = 60;
const TOKEN_SKEW_S: i64 = 5;

/// Which Kling generation endpoint a provider binding talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlingEndpoint {
    TextToVideo,
    ImageToVideo,
    MotionControl,
}

impl KlingEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::TextToVideo => "/v1/videos/text2video",
            Self::ImageToVideo => "/v1/videos/image2video",
            Self::MotionControl => "/v1/videos/motion-control",
        }
    }

    fn needs_image(&self) -> bool {
        !matches!(self, Self::TextToVideo)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    exp: i64,
    nbf: i64,
}

pub struct KlingProvider {
    name: String,
    endpoint: KlingEndpoint,
    model: String,
    base_url: String,
    access_key: String,
    secret_key: String,
    client: reqwest::Client,
    poll_after_s: u64,
    timeout_s: u64,
}

impl std::fmt::Debug for KlingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlingProvider")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KlingProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: KlingEndpoint,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            client,
            poll_after_s: DEFAULT_POLL_AFTER_S,
            timeout_s: DEFAULT_TASK_TIMEOUT_S,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = trim_base(base_url);
        self
    }

    pub fn with_task_timing(mut self, poll_after_s: u64, timeout_s: u64) -> Self {
        self.poll_after_s = poll_after_s;
        self.timeout_s = timeout_s;
        self
    }

    fn token(&self) -> Result<String> {
        sign_token(&self.access_key, &self.secret_key, chrono::Utc::now().timestamp())
    }

    fn task_url(&self, task_id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, self.endpoint.path()))
            .with_context(|| format!("invalid Kling base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Kling base URL cannot carry a path: {}", self.base_url))?
            .push(task_id);
        Ok(url)
    }
}

/// HS256 token valid from `now - 5s` to `now + 60s`.
pub(crate) fn sign_token(access_key: &str, secret_key: &str, now: i64) -> Result<String> {
    let claims = Claims {
        iss: access_key,
        exp: now + TOKEN_TTL_S,
        nbf: now - TOKEN_SKEW_S,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret_key.as_bytes()),
    )
    .context("failed to sign Kling token")
}

/// Request body for `endpoint`. Fields of a passthrough `body` object
/// (`duration`, `sound`, `mode`, ...) override the derived ones.
pub(crate) fn build_body(
    endpoint: KlingEndpoint,
    model: &str,
    params: &GenerationParams,
) -> Result<Value, String> {
    let mut body = Map::new();
    body.insert("model_name".into(), json!(model));
    body.insert("mode".into(), json!(DEFAULT_MODE));
    body.insert("duration".into(), json!(DEFAULT_DURATION));
    body.insert("prompt".into(), json!(params.prompt));

    match (endpoint.needs_image(), params.images.as_slice()) {
        (true, []) => return Err(format!("{} needs an input image", endpoint.path())),
        (true, [image, rest @ ..]) => {
            body.insert("image".into(), json!(image));
            if let Some(tail) = rest.first() {
                body.insert("image_tail".into(), json!(tail));
            }
        }
        (false, []) => {
            if let Some(ratio) = &params.aspect_ratio {
                body.insert("aspect_ratio".into(), json!(ratio));
            }
        }
        (false, _) => {
            return Err("text-to-video takes no input image; use an image-to-video model".into());
        }
    }

    if let Some(Value::Object(extra)) = &params.body {
        for (key, value) in extra {
            body.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(body))
}

#[async_trait]
impl GenerationProvider for KlingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: &GenerationParams) -> Result<InvokeOutcome> {
        if params.is_test {
            return Ok(InvokeOutcome::rejected(TEST_JOB_REASON));
        }
        let body = match build_body(self.endpoint, &self.model, params) {
            Ok(body) => body,
            Err(reason) => return Ok(InvokeOutcome::rejected(reason)),
        };
        let endpoint = format!("{}{}", self.base_url, self.endpoint.path());
        let response = send_json(
            self.client
                .post(&endpoint)
                .bearer_auth(self.token()?)
                .json(&body),
            &endpoint,
        )
        .await?;
        let outcome = parse_create(&response, self.poll_after_s, self.timeout_s);
        if let InvokeOutcome::Rejected { reason } = &outcome {
            error!(provider = %self.name, reason = %reason, "kling task creation refused");
        }
        Ok(outcome)
    }

    fn supports_polling(&self) -> bool {
        true
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome> {
        let url = self.task_url(task_id)?;
        let endpoint = url.to_string();
        let response = send_json(
            self.client.get(url).bearer_auth(self.token()?),
            &endpoint,
        )
        .await?;
        Ok(parse_status(&response))
    }
}

pub(crate) fn parse_create(response: &Value, poll_after_s: u64, timeout_s: u64) -> InvokeOutcome {
    match response
        .get("data")
        .and_then(|d| d.get("task_id"))
        .and_then(Value::as_str)
    {
        Some(id) if !id.is_empty() => InvokeOutcome::Task(TaskHandle {
            id: id.to_string(),
            poll_after_s,
            timeout_s,
        }),
        _ => InvokeOutcome::rejected(format!("create failed: {response}")),
    }
}

pub(crate) fn parse_status(response: &Value) -> PollOutcome {
    let data = response.get("data");
    let field = |name: &str| data.and_then(|d| d.get(name));
    match field("task_status").and_then(Value::as_str) {
        Some("succeed") => {
            let url = field("task_result")
                .and_then(|r| r.get("videos"))
                .and_then(|v| v.get(0))
                .and_then(|v| v.get("url"))
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty());
            match url {
                Some(url) => PollOutcome::Succeeded {
                    result: url.to_string(),
                },
                None => PollOutcome::Failed {
                    reason: "done but url missing".to_string(),
                },
            }
        }
        Some("failed") => PollOutcome::Failed {
            reason: field("task_status_msg")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("failed")
                .to_string(),
        },
        _ => PollOutcome::Pending { progress: None },
    }
}
