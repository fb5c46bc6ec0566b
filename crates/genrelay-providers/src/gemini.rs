//! Gemini image generation over the `generateContent` REST endpoint.
//!
//! Synchronous: the response carries the image inline as base64. Reference
//! images named in the job are downloaded first and sent inline too; the
//! downloads share one process-wide semaphore.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use genrelay_core::{AppError, Artifact, GenerationParams, InvokeOutcome};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::http::{send_json, trim_base};
use crate::provider::{GenerationProvider, TEST_JOB_REASON};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 20;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GeminiImageProvider {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    downloads: Arc<Semaphore>,
}

impl std::fmt::Debug for GeminiImageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiImageProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiImageProvider {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            client,
            downloads: Arc::new(Semaphore::new(DEFAULT_DOWNLOAD_CONCURRENCY)),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = trim_base(base_url);
        self
    }

    /// Share a download semaphore with other Gemini providers.
    pub fn with_download_limit(mut self, downloads: Arc<Semaphore>) -> Self {
        self.downloads = downloads;
        self
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let _permit = self
            .downloads
            .acquire()
            .await
            .context("download semaphore closed")?;
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::TransportFault {
                endpoint: url.to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamRejected(format!(
                "reference image {url} returned status {status}"
            ))
            .into());
        }
        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read reference image {url}"))?;
        let mime = image_mime(url, header_type.as_deref());
        Ok((bytes.to_vec(), mime))
    }

    async fn request_body(&self, params: &GenerationParams) -> Result<Value> {
        let mut parts = vec![json!({ "text": params.prompt })];
        for url in &params.images {
            let (bytes, mime) = self.download(url).await?;
            debug!(url = %url, mime = %mime, len = bytes.len(), "reference image downloaded");
            parts.push(json!({
                "inlineData": { "mimeType": mime, "data": STANDARD.encode(&bytes) }
            }));
        }

        let mut image_config = serde_json::Map::new();
        if let Some(ratio) = &params.aspect_ratio {
            image_config.insert("aspectRatio".into(), json!(ratio));
        }
        if let Some(quality) = &params.quality {
            image_config.insert("imageSize".into(), json!(quality));
        }

        let mut generation_config = json!({ "responseModalities": ["IMAGE"] });
        if !image_config.is_empty() {
            generation_config["imageConfig"] = Value::Object(image_config);
        }
        Ok(json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        }))
    }
}

#[async_trait]
impl GenerationProvider for GeminiImageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: &GenerationParams) -> Result<InvokeOutcome> {
        if params.is_test {
            return Ok(InvokeOutcome::rejected(TEST_JOB_REASON));
        }
        let body = self.request_body(params).await?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = send_json(
            self.client
                .post(&endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(&body),
            &endpoint,
        )
        .await?;
        parse_generate_response(&response)
    }
}

/// Map a `generateContent` response to an outcome.
pub(crate) fn parse_generate_response(response: &Value) -> Result<InvokeOutcome> {
    let Some(candidate) = response
        .get("candidates")
        .and_then(|c| c.get(0))
    else {
        warn!(response = %response, "no candidates in response");
        return Ok(InvokeOutcome::rejected("No response candidates from model"));
    };

    let finish = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("FINISH_REASON_UNSPECIFIED");
    if finish != "STOP" {
        warn!(finish, "generation did not finish normally");
        return Ok(InvokeOutcome::rejected(format!("finish reason {finish}")));
    }

    let inline = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| {
            parts
                .iter()
                .find_map(|p| p.get("inlineData").or_else(|| p.get("inline_data")))
        });
    let Some(inline) = inline else {
        return Ok(InvokeOutcome::rejected("No image in response"));
    };

    let data = inline
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("inline image part has no data"))?;
    let bytes = STANDARD
        .decode(data)
        .context("inline image is not valid base64")?;
    let mime = inline
        .get("mimeType")
        .or_else(|| inline.get("mime_type"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("image/png");
    Ok(InvokeOutcome::Artifact(Artifact::new(bytes, mime)))
}

/// Media type of a reference image: the response header when it names an
/// image, else a guess from the URL extension, else JPEG.
pub(crate) fn image_mime(url: &str, header: Option<&str>) -> String {
    if let Some(header) = header {
        let essence = header.split(';').next().unwrap_or("").trim();
        if essence.starts_with("image/") {
            return essence.to_string();
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiImageProvider {
        GeminiImageProvider::new(
            "gemini_3_image",
            "gemini-3-pro-image-preview",
            "key",
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn test_test_job_rejected_without_upstream() {
        let params = GenerationParams {
            prompt: "cat".into(),
            is_test: true,
            ..Default::default()
        };
        // Unroutable base: any request would fail with a transport error.
        let provider = provider().with_base_url("http://127.0.0.1:9");
        let outcome = provider.invoke(&params).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::rejected(TEST_JOB_REASON));
    }

    #[tokio::test]
    async fn test_request_body_carries_image_config() {
        let params = GenerationParams {
            prompt: "a lighthouse".into(),
            aspect_ratio: Some("16:9".into()),
            quality: Some("2K".into()),
            ..Default::default()
        };
        let body = provider().request_body(&params).await.unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a lighthouse");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "IMAGE");
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(body["generationConfig"]["imageConfig"]["imageSize"], "2K");
    }

    #[test]
    fn test_parse_inline_image() {
        let response = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [
                    { "text": "here you go" },
                    { "inlineData": { "mimeType": "image/webp", "data": STANDARD.encode(b"RIFF") } }
                ]}
            }]
        });
        match parse_generate_response(&response).unwrap() {
            InvokeOutcome::Artifact(artifact) => {
                assert_eq!(artifact.bytes, b"RIFF");
                assert_eq!(artifact.media_type, "image/webp");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_missing_mime_defaults_to_png() {
        let response = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [{ "inlineData": { "data": STANDARD.encode([1, 2]) } }] }
            }]
        });
        match parse_generate_response(&response).unwrap() {
            InvokeOutcome::Artifact(artifact) => assert_eq!(artifact.extension(), "png"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejections() {
        let empty = json!({ "candidates": [] });
        assert_eq!(
            parse_generate_response(&empty).unwrap(),
            InvokeOutcome::rejected("No response candidates from model")
        );

        let safety = json!({ "candidates": [{ "finishReason": "IMAGE_SAFETY" }] });
        assert_eq!(
            parse_generate_response(&safety).unwrap(),
            InvokeOutcome::rejected("finish reason IMAGE_SAFETY")
        );

        let text_only = json!({
            "candidates": [{ "finishReason": "STOP", "content": { "parts": [{ "text": "no" }] } }]
        });
        assert_eq!(
            parse_generate_response(&text_only).unwrap(),
            InvokeOutcome::rejected("No image in response")
        );
    }

    #[test]
    fn test_parse_bad_base64_is_error() {
        let response = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [{ "inlineData": { "data": "!!!" } }] }
            }]
        });
        assert!(parse_generate_response(&response).is_err());
    }

    #[test]
    fn test_image_mime_prefers_header() {
        assert_eq!(
            image_mime("https://cdn/x.jpg", Some("image/png; charset=binary")),
            "image/png"
        );
        assert_eq!(
            image_mime("https://cdn/x.webp?sig=1", Some("application/octet-stream")),
            "image/webp"
        );
        assert_eq!(image_mime("https://cdn/blob", None), "image/jpeg");
    }
}
