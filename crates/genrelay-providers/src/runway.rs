//! Runway task API: create a task, then poll `/v1/tasks/{id}`.

use anyhow::Result;
use async_trait::async_trait;
use genrelay_core::{GenerationParams, InvokeOutcome, PollOutcome, TaskHandle};
use serde_json::{Value, json};

use crate::http::{send_json, trim_base};
use crate::provider::{GenerationProvider, TEST_JOB_REASON};

pub const DEFAULT_BASE_URL: &str = "https://api.dev.runwayml.com";
const API_VERSION: &str = "2024-11-06";
pub const DEFAULT_POLL_AFTER_S: u64 = 5;
pub const DEFAULT_TASK_TIMEOUT_S: u64 = 600;

pub struct RunwayProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    poll_after_s: u64,
    timeout_s: u64,
}

impl std::fmt::Debug for RunwayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunwayProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RunwayProvider {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            client,
            poll_after_s: DEFAULT_POLL_AFTER_S,
            timeout_s: DEFAULT_TASK_TIMEOUT_S,
        }
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

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header("X-Runway-Version", API_VERSION)
    }
}

#[async_trait]
impl GenerationProvider for RunwayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: &GenerationParams) -> Result<InvokeOutcome> {
        if params.is_test {
            return Ok(InvokeOutcome::rejected(TEST_JOB_REASON));
        }
        let Some(path) = params.request_url.as_deref() else {
            return Ok(InvokeOutcome::rejected("request_url is required"));
        };
        let endpoint = format!("{}{}", self.base_url, path);
        let body = params.body.clone().unwrap_or_else(|| json!({}));
        let response = send_json(self.request(self.client.post(&endpoint)).json(&body), &endpoint).await?;
        Ok(parse_create(&response, self.poll_after_s, self.timeout_s))
    }

    fn supports_polling(&self) -> bool {
        true
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome> {
        let endpoint = format!("{}/v1/tasks/{}", self.base_url, task_id);
        let response = send_json(self.request(self.client.get(&endpoint)), &endpoint).await?;
        Ok(parse_task(&response))
    }
}

pub(crate) fn parse_create(response: &Value, poll_after_s: u64, timeout_s: u64) -> InvokeOutcome {
    match response.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => InvokeOutcome::Task(TaskHandle {
            id: id.to_string(),
            poll_after_s,
            timeout_s,
        }),
        _ => InvokeOutcome::rejected(format!("create failed: {response}")),
    }
}

pub(crate) fn parse_task(response: &Value) -> PollOutcome {
    let status = response.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "SUCCEEDED" => {
            let url = response
                .get("output")
                .and_then(|o| o.get(0))
                .and_then(Value::as_str)
                .or_else(|| response.get("result_url").and_then(Value::as_str));
            match url {
                Some(url) => PollOutcome::Succeeded {
                    result: url.to_string(),
                },
                None => PollOutcome::Failed {
                    reason: "done but url missing".to_string(),
                },
            }
        }
        "FAILED" | "CANCELLED" => PollOutcome::Failed {
            reason: response
                .get("failure")
                .and_then(Value::as_str)
                .unwrap_or(status)
                .to_string(),
        },
        _ => PollOutcome::Pending {
            progress: response.get("progress").and_then(Value::as_f64),
        },
    }
}
