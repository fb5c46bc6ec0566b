//! Kie task API. Creation returns `{code, msg, data: {taskId}}`; task
//! state comes from `recordInfo`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use genrelay_core::{GenerationParams, InvokeOutcome, PollOutcome, TaskHandle};
use serde_json::{Value, json};
use tracing::error;

use crate::http::{send_json, trim_base};
use crate::provider::{GenerationProvider, TEST_JOB_REASON};

pub const DEFAULT_BASE_URL: &str = "https://api.kie.ai";
const RECORD_INFO_PATH: &str = "/api/v1/jobs/recordInfo";
pub const DEFAULT_POLL_AFTER_S: u64 = 5;
pub const DEFAULT_TASK_TIMEOUT_S: u64 = 900;

pub struct KieProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    poll_after_s: u64,
    timeout_s: u64,
}

impl std::fmt::Debug for KieProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KieProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KieProvider {
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

    fn record_request(&self, task_id: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, RECORD_INFO_PATH))
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
    }
}

#[async_trait]
impl GenerationProvider for KieProvider {
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
        let response = send_json(
            self.client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body),
            &endpoint,
        )
        .await?;
        let outcome = parse_create(&response, self.poll_after_s, self.timeout_s);
        if let InvokeOutcome::Rejected { reason } = &outcome {
            error!(provider = %self.name, reason = %reason, "kie task creation refused");
        }
        Ok(outcome)
    }

    fn supports_polling(&self) -> bool {
        true
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome> {
        let endpoint = format!("{}{}", self.base_url, RECORD_INFO_PATH);
        let response = send_json(self.record_request(task_id), &endpoint).await?;
        parse_record(&response)
    }
}

fn message(response: &Value) -> String {
    response
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

pub(crate) fn parse_create(response: &Value, poll_after_s: u64, timeout_s: u64) -> InvokeOutcome {
    if response.get("code").and_then(Value::as_i64) != Some(200) {
        return InvokeOutcome::rejected(message(response));
    }
    match response
        .get("data")
        .and_then(|d| d.get("taskId"))
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

pub(crate) fn parse_record(response: &Value) -> Result<PollOutcome> {
    if response.get("code").and_then(Value::as_i64) != Some(200) {
        anyhow::bail!("recordInfo returned an error: {}", message(response));
    }
    let data = response.get("data").cloned().unwrap_or(Value::Null);
    let state = data.get("state").and_then(Value::as_str).unwrap_or("");
    match state {
        "success" => {
            let result = data
                .get("resultJson")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(serde_json::from_str::<Value>)
                .transpose()
                .context("resultJson is not valid JSON")?;
            let url = result
                .as_ref()
                .and_then(|r| r.get("resultUrls"))
                .and_then(|urls| urls.get(0))
                .and_then(Value::as_str);
            Ok(match url {
                Some(url) => PollOutcome::Succeeded {
                    result: url.to_string(),
                },
                None => PollOutcome::Failed {
                    reason: "done but url missing".to_string(),
                },
            })
        }
        "fail" => Ok(PollOutcome::Failed {
            reason: data
                .get("failMsg")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("failed")
                .to_string(),
        }),
        _ => Ok(PollOutcome::Pending {
            progress: data.get("progress").and_then(Value::as_f64),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_encodes_task_id() {
        let provider = KieProvider::new("kie", "key", reqwest::Client::new())
            .with_base_url("https://kie.test/");
        let request = provider.record_request("a&b=c d/e").build().unwrap();
        assert_eq!(request.url().path(), RECORD_INFO_PATH);
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, vec![("taskId".to_string(), "a&b=c d/e".to_string())]);
    }

    #[test]
    fn test_parse_create_ok() {
        let response = json!({ "code": 200, "msg": "success", "data": { "taskId": "k-1" } });
        match parse_create(&response, 5, 900) {
            InvokeOutcome::Task(handle) => {
                assert_eq!(handle.id, "k-1");
                assert_eq!(handle.timeout_s, 900);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_create_error_code() {
        let response = json!({ "code": 402, "msg": "Credits insufficient" });
        assert_eq!(
            parse_create(&response, 5, 900),
            InvokeOutcome::rejected("Credits insufficient")
        );
    }

    #[test]
    fn test_parse_record_success() {
        let response = json!({
            "code": 200,
            "data": {
                "state": "success",
                "resultJson": "{\"resultUrls\":[\"https://cdn.kie.ai/v.mp4\"]}"
            }
        });
        assert_eq!(
            parse_record(&response).unwrap(),
            PollOutcome::Succeeded {
                result: "https://cdn.kie.ai/v.mp4".into()
            }
        );
    }

    #[test]
    fn test_parse_record_fail_and_pending() {
        let failed = json!({ "code": 200, "data": { "state": "fail", "failMsg": "nsfw" } });
        assert_eq!(
            parse_record(&failed).unwrap(),
            PollOutcome::Failed {
                reason: "nsfw".into()
            }
        );
        let waiting = json!({ "code": 200, "data": { "state": "generating" } });
        assert_eq!(
            parse_record(&waiting).unwrap(),
            PollOutcome::Pending { progress: None }
        );
    }

    #[test]
    fn test_parse_record_error_code_is_fault() {
        let response = json!({ "code": 500, "msg": "internal" });
        assert!(parse_record(&response).is_err());
    }
}
