//! # Herald Scheduler
//!
//! The poll-driven dispatch engine and its two pure helpers.
//!
//! ```text
//! Poller (tokio interval)
//!   ├── due query (enabled, dispatchable status, next_run_at <= now)
//!   ├── nextrun: when is this item due again? (croner + chrono-tz)
//!   ├── targets: which chats receive this occurrence?
//!   ├── claim ledger: at most one attempt per (item, chat, occurrence)
//!   └── Deliver impl → terminal outcome written back
//! ```
//!
//! Destinations are dispatched sequentially within a tick, keeping the
//! worker under Telegram's global rate budget.

pub mod engine;
pub mod nextrun;
pub mod targets;

pub use engine::{run_poller, Poller};
pub use nextrun::next_occurrence;
pub use targets::resolve_targets;
