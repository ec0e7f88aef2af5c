//! # Herald Core
//!
//! Shared building blocks for the Herald broadcast worker: the broadcast
//! data model, configuration, the error taxonomy, and the delivery trait
//! seam that connects the scheduler to a concrete provider.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
pub use traits::Deliver;
pub use types::{
    BroadcastPayload, Chat, Delivery, DeliveryStatus, ItemStatus, ParseMode, ScheduleKind,
    ScheduledItem, TargetsMode, MAX_ALBUM_ITEMS,
};
