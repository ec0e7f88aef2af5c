//! Telegram transport for Herald: the Bot API client, media acquisition,
//! and the resilient send pipeline implementing [`herald_core::Deliver`].

pub mod api;
pub mod media;
pub mod pipeline;

pub use api::{MediaPart, SendOptions, TelegramApi, Transport};
pub use media::MediaFetcher;
pub use pipeline::SendPipeline;
