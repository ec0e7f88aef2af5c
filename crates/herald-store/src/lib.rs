//! # Herald Store
//!
//! SQLite-backed persistence — survives restarts, supports concurrent
//! workers. Three tables:
//!
//! - `scheduled_messages` — broadcast items and their poller-driven state
//! - `deliveries` — the claim ledger; `(scheduled_id, chat_id, run_at)` is
//!   UNIQUE and is the only idempotency mechanism in the system
//! - `chats` — destination registry, written by discovery, read here
//!
//! Instants are stored as RFC 3339 text; naive values read back from older
//! rows are interpreted as UTC.

mod db;
mod ledger;

pub use db::BroadcastDb;
pub use ledger::Claim;
