//! Telegram Bot API notifier.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use genrelay_core::{Artifact, MessageId, UserId};
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use std::time::Duration;

use crate::sink::Notifier;

const TEXT_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(180);

pub struct TelegramNotifier {
    base: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for TelegramNotifier {
    // The base URL embeds the bot token.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier").finish_non_exhaustive()
    }
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: &str, client: reqwest::Client) -> Self {
        Self {
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
            client,
        }
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .timeout(TEXT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("telegram {method} request failed"))?;
        let value: Value = response
            .json()
            .await
            .with_context(|| format!("telegram {method} returned invalid JSON"))?;
        check_ok(method, value)
    }
}

fn check_ok(method: &str, value: Value) -> Result<Value> {
    if value.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(value);
    }
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    Err(anyhow!("telegram {method} failed: {description}"))
}

fn message_id(value: &Value) -> Option<MessageId> {
    value
        .get("result")
        .and_then(|r| r.get("message_id"))
        .and_then(Value::as_i64)
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, user: UserId, text: &str) -> Result<Option<MessageId>> {
        let value = self
            .call(
                "sendMessage",
                json!({ "chat_id": user, "text": text, "parse_mode": "HTML" }),
            )
            .await?;
        Ok(message_id(&value))
    }

    async fn edit_text(&self, user: UserId, message: MessageId, text: &str) -> Result<()> {
        self.call(
            "editMessageText",
            json!({ "chat_id": user, "message_id": message, "text": text, "parse_mode": "HTML" }),
        )
        .await?;
        Ok(())
    }

    async fn send_artifact(
        &self,
        user: UserId,
        artifact: &Artifact,
        filename: &str,
        caption: &str,
    ) -> Result<()> {
        // Upload indicator only; its failure does not block the upload.
        let _ = self
            .call(
                "sendChatAction",
                json!({ "chat_id": user, "action": "upload_document" }),
            )
            .await;

        let part = Part::bytes(artifact.bytes.clone())
            .file_name(filename.to_string())
            .mime_str(&artifact.media_type)
            .with_context(|| format!("invalid media type '{}'", artifact.media_type))?;
        let form = Form::new()
            .text("chat_id", user.to_string())
            .text("caption", caption.to_string())
            .part("document", part);
        let response = self
            .client
            .post(format!("{}/sendDocument", self.base))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .context("telegram sendDocument request failed")?;
        let value: Value = response
            .json()
            .await
            .context("telegram sendDocument returned invalid JSON")?;
        check_ok("sendDocument", value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_extracted() {
        let value = json!({ "ok": true, "result": { "message_id": 991, "chat": { "id": 5 } } });
        assert_eq!(message_id(&value), Some(991));
        assert_eq!(message_id(&json!({ "ok": true, "result": true })), None);
    }

    #[test]
    fn test_check_ok_surfaces_description() {
        let err = check_ok(
            "sendMessage",
            json!({ "ok": false, "description": "Forbidden: bot was blocked by the user" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("bot was blocked"));
    }

    #[test]
    fn test_debug_hides_token() {
        let notifier = TelegramNotifier::new("https://api.telegram.org/", "123:SECRET", reqwest::Client::new());
        assert!(!format!("{notifier:?}").contains("SECRET"));
        assert_eq!(notifier.base, "https://api.telegram.org/bot123:SECRET");
    }
}
