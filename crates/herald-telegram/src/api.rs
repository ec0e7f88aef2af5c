//! Telegram Bot API client — message and album sending via HTTPS.

use async_trait::async_trait;
use herald_core::{HeraldError, ParseMode, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Rendering options applied to a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub parse_mode: ParseMode,
    pub disable_preview: bool,
}

impl From<&herald_core::BroadcastPayload> for SendOptions {
    fn from(p: &herald_core::BroadcastPayload) -> Self {
        Self {
            parse_mode: p.parse_mode,
            disable_preview: p.disable_preview,
        }
    }
}

/// One album member: a scratch file to upload, or a URL Telegram fetches
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPart {
    Local(PathBuf),
    Remote(String),
}

/// Provider seam for the send pipeline. Implemented by [`TelegramApi`] in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text message; returns provider message IDs.
    async fn send_text(&self, chat_id: i64, text: &str, opts: SendOptions) -> Result<Vec<i64>>;

    /// Send one media album with an optional caption on the first item.
    async fn send_media_group(
        &self,
        chat_id: i64,
        parts: &[MediaPart],
        caption: Option<&str>,
        opts: SendOptions,
    ) -> Result<Vec<i64>>;
}

/// Telegram Bot API client.
pub struct TelegramApi {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl TelegramApi {
    pub fn new(token: &str, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HeraldError::Http(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base, self.token, method)
    }

    /// Get bot info, used as a connectivity check at startup.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        let response = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| HeraldError::Http(format!("getMe failed: {e}")))?;
        let body: TelegramApiResponse<TelegramUser> = response
            .json()
            .await
            .map_err(|e| HeraldError::Http(format!("invalid getMe response: {e}")))?;
        unwrap_response(body)
    }
}

#[async_trait]
impl Transport for TelegramApi {
    async fn send_text(&self, chat_id: i64, text: &str, opts: SendOptions) -> Result<Vec<i64>> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": opts.disable_preview,
        });
        if opts.parse_mode == ParseMode::Html {
            body["parse_mode"] = serde_json::json!("HTML");
        }

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| HeraldError::Http(format!("sendMessage failed: {e}")))?;
        let body: TelegramApiResponse<TelegramMessage> = response
            .json()
            .await
            .map_err(|e| HeraldError::Http(format!("invalid send response: {e}")))?;
        let msg = unwrap_response(body)?;
        Ok(vec![msg.message_id])
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        parts: &[MediaPart],
        caption: Option<&str>,
        opts: SendOptions,
    ) -> Result<Vec<i64>> {
        let mut form = reqwest::multipart::Form::new().text("chat_id", chat_id.to_string());
        let mut media = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let mut entry = serde_json::json!({ "type": "photo" });
            match part {
                MediaPart::Remote(url) => {
                    entry["media"] = serde_json::json!(url);
                }
                MediaPart::Local(path) => {
                    let field = format!("file{i}");
                    entry["media"] = serde_json::json!(format!("attach://{field}"));
                    let bytes = tokio::fs::read(path).await?;
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| field.clone());
                    form = form.part(
                        field,
                        reqwest::multipart::Part::bytes(bytes).file_name(filename),
                    );
                }
            }
            // Telegram renders an album caption off the first item only.
            if i == 0 {
                if let Some(text) = caption {
                    entry["caption"] = serde_json::json!(text);
                    if opts.parse_mode == ParseMode::Html {
                        entry["parse_mode"] = serde_json::json!("HTML");
                    }
                }
            }
            media.push(entry);
        }
        form = form.text("media", serde_json::Value::Array(media).to_string());

        let response = self
            .client
            .post(self.api_url("sendMediaGroup"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| HeraldError::Http(format!("sendMediaGroup failed: {e}")))?;
        let body: TelegramApiResponse<Vec<TelegramMessage>> = response
            .json()
            .await
            .map_err(|e| HeraldError::Http(format!("invalid album response: {e}")))?;
        let messages = unwrap_response(body)?;
        Ok(messages.into_iter().map(|m| m.message_id).collect())
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

/// Unwrap the Bot API envelope, mapping HTTP 429 to [`HeraldError::RateLimited`].
fn unwrap_response<T>(body: TelegramApiResponse<T>) -> Result<T> {
    if body.ok {
        return body
            .result
            .ok_or_else(|| HeraldError::transport("ok response with empty result"));
    }
    if body.error_code == Some(429) {
        let retry_after_secs = body
            .parameters
            .and_then(|p| p.retry_after)
            .unwrap_or(1);
        return Err(HeraldError::RateLimited { retry_after_secs });
    }
    Err(HeraldError::transport(format!(
        "Telegram API error: {}",
        body.description.unwrap_or_default()
    )))
}
