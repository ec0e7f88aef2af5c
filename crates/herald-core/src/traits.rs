//! Trait seams between the scheduler and concrete providers.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BroadcastPayload;

/// Delivers one rendered payload to one destination chat.
///
/// The poller drives this once per claimed (item, chat, occurrence) triple;
/// the concrete implementation owns retries, media handling and fallback.
/// Returns the provider message IDs on success.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, chat_id: i64, payload: &BroadcastPayload) -> Result<Vec<i64>>;
}
