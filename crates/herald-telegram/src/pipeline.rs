//! Resilient send pipeline — throttling, flood-wait retry, and a
//! degrade-don't-drop fallback cascade for media broadcasts.
//!
//! Delivery of one payload to one chat tries, in order:
//!   1. album of downloaded (and normalized) files re-uploaded to Telegram,
//!   2. album of the original remote references,
//!   3. plain text: the caption, then one link message per reference.
//! Only when every tier fails does delivery error, carrying the last cause.

use crate::api::{MediaPart, SendOptions, TelegramApi, Transport};
use crate::media::{normalize_photo, MediaFetcher};
use async_trait::async_trait;
use herald_core::{BroadcastPayload, Deliver, HeraldError, Result, MAX_ALBUM_ITEMS};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sends broadcast payloads through a [`Transport`], spacing consecutive
/// sends by a minimum delay. The throttle is per pipeline, not global.
pub struct SendPipeline<T: Transport> {
    transport: T,
    fetcher: MediaFetcher,
    min_delay: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl SendPipeline<TelegramApi> {
    pub fn new(api: TelegramApi, min_delay: Duration) -> Self {
        Self::with_transport(api, min_delay)
    }
}

impl<T: Transport> SendPipeline<T> {
    pub fn with_transport(transport: T, min_delay: Duration) -> Self {
        Self {
            transport,
            fetcher: MediaFetcher::new(),
            min_delay,
            last_send: Mutex::new(None),
        }
    }

    /// Sleep until `min_delay` has passed since the previous send.
    async fn throttle(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `op` once; on a flood-wait response, sleep `retry_after + 1`
    /// seconds and retry exactly once.
    async fn with_flood_retry<F, Fut>(&self, op: F) -> Result<Vec<i64>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Vec<i64>>>,
    {
        self.throttle().await;
        match op().await {
            Err(HeraldError::RateLimited { retry_after_secs }) => {
                let wait = retry_after_secs + 1;
                tracing::warn!("⏳ Rate limited, sleeping {wait}s before one retry");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                op().await
            }
            other => other,
        }
    }

    async fn send_text(&self, chat_id: i64, text: &str, opts: SendOptions) -> Result<Vec<i64>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        self.with_flood_retry(|| self.transport.send_text(chat_id, text, opts))
            .await
    }

    async fn send_album(&self, chat_id: i64, payload: &BroadcastPayload) -> Result<Vec<i64>> {
        let refs: Vec<&str> = payload
            .media_urls
            .iter()
            .map(String::as_str)
            .take(MAX_ALBUM_ITEMS)
            .collect();
        let opts = SendOptions::from(payload);
        let caption = Some(payload.caption.as_str()).filter(|c| !c.is_empty());

        // Scratch space for downloads; removed on every exit path when
        // the guard drops.
        let scratch = tempfile::tempdir()?;

        let mut local = Vec::new();
        for r in &refs {
            match self.fetcher.fetch(r, scratch.path()).await {
                Ok(path) => local.push(MediaPart::Local(normalize_photo(&path, scratch.path()))),
                Err(e) => tracing::warn!("Media fetch failed for {r}: {e}"),
            }
        }

        let uploaded = if local.is_empty() {
            Err(HeraldError::transport("no media reference could be fetched"))
        } else {
            self.with_flood_retry(|| self.transport.send_media_group(chat_id, &local, caption, opts))
                .await
        };
        let upload_err = match uploaded {
            Ok(ids) => return Ok(ids),
            Err(e) => e,
        };

        tracing::warn!("Album upload to {chat_id} failed ({upload_err}), retrying with remote references");
        let remote: Vec<MediaPart> = refs
            .iter()
            .map(|r| MediaPart::Remote(r.to_string()))
            .collect();
        let by_ref = self
            .with_flood_retry(|| self.transport.send_media_group(chat_id, &remote, caption, opts))
            .await;
        let ref_err = match by_ref {
            Ok(ids) => return Ok(ids),
            Err(e) => e,
        };

        tracing::warn!("Remote album to {chat_id} failed ({ref_err}), degrading to text links");
        // Previews stay enabled here so the links still render the media.
        let link_opts = SendOptions {
            disable_preview: false,
            ..opts
        };
        let mut ids = Vec::new();
        if let Some(text) = caption {
            ids.extend(self.send_text(chat_id, text, link_opts).await?);
        }
        for r in &refs {
            ids.extend(self.send_text(chat_id, r, link_opts).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl<T: Transport> Deliver for SendPipeline<T> {
    async fn deliver(&self, chat_id: i64, payload: &BroadcastPayload) -> Result<Vec<i64>> {
        if payload.media_urls.is_empty() {
            self.send_text(chat_id, &payload.caption, SendOptions::from(payload))
                .await
        } else {
            self.send_album(chat_id, payload).await
        }
    }
}
