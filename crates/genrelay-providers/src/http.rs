//! Shared request plumbing for the HTTP adapters.

use anyhow::{Context, Result};
use genrelay_core::AppError;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

const BODY_SNIPPET: usize = 500;

/// Send a request and decode a JSON response.
///
/// Connection failures, 429 and 5xx map to [`AppError::TransportFault`];
/// other non-success statuses map to [`AppError::UpstreamRejected`].
pub(crate) async fn send_json(request: RequestBuilder, endpoint: &str) -> Result<Value> {
    let response = request.send().await.map_err(|e| AppError::TransportFault {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;
    let status = response.status();
    let body = response.text().await.map_err(|e| AppError::TransportFault {
        endpoint: endpoint.to_string(),
        message: format!("failed to read response body: {e}"),
    })?;
    classify_status(status, &body, endpoint)?;
    serde_json::from_str(&body)
        .with_context(|| format!("invalid JSON from {endpoint}: {}", snippet(&body)))
}

pub(crate) fn classify_status(status: StatusCode, body: &str, endpoint: &str) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(AppError::TransportFault {
            endpoint: endpoint.to_string(),
            message: format!("status {status}: {}", snippet(body)),
        });
    }
    Err(AppError::UpstreamRejected(format!(
        "status {status}: {}",
        snippet(body)
    )))
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(BODY_SNIPPET) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

pub(crate) fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
