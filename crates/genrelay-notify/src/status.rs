//! HTTP job-status callback.

use anyhow::{Context, Result};
use async_trait::async_trait;
use genrelay_config::StatusConfig;
use genrelay_core::{JobId, JobStatus};
use serde::Serialize;
use std::time::Duration;

use crate::sink::StatusSink;

const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct StatusUpdate<'a> {
    job_id: JobId,
    status: JobStatus,
    task_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Results<'a> {
    job_id: JobId,
    results: &'a [String],
}

pub struct HttpStatusSink {
    status_url: String,
    results_url: String,
    auth_header: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStatusSink")
            .field("status_url", &self.status_url)
            .field("results_url", &self.results_url)
            .finish_non_exhaustive()
    }
}

impl HttpStatusSink {
    pub fn new(config: &StatusConfig, api_key: impl Into<String>, client: reqwest::Client) -> Self {
        let base = config.base_url.trim_end_matches('/');
        Self {
            status_url: format!("{base}{}", config.status_path),
            results_url: format!("{base}{}", config.results_path),
            auth_header: config.auth_header.clone(),
            api_key: api_key.into(),
            client,
        }
    }

    async fn post<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<()> {
        self.client
            .post(url)
            .timeout(TIMEOUT)
            .header(self.auth_header.as_str(), self.api_key.as_str())
            .json(body)
            .send()
            .await
            .with_context(|| format!("status callback to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("status callback to {url} was refused"))?;
        Ok(())
    }
}

#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn job_status(&self, job_id: JobId, status: JobStatus, task_id: Option<&str>) -> Result<()> {
        let body = StatusUpdate {
            job_id,
            status,
            task_id,
        };
        self.post(&self.status_url, &body).await
    }

    async fn job_succeeded(&self, job_id: JobId, results: &[String]) -> Result<()> {
        self.post(&self.results_url, &Results { job_id, results })
            .await
    }
}
