//! Broadcast data model — scheduled items, deliveries, and the chat registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram albums carry at most ten media items; extras are dropped at send
/// time, not rejected.
pub const MAX_ALBUM_ITEMS: usize = 10;

/// A scheduled broadcast: content, targeting, and timing for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledItem {
    /// Unique item ID.
    pub id: String,
    /// Broadcast title (rendered bold in HTML mode).
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ordered media references (URLs or local paths). Only the first
    /// [`MAX_ALBUM_ITEMS`] are effective at send time.
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub parse_mode: ParseMode,
    /// Suppress link previews for text sends.
    #[serde(default = "default_true")]
    pub disable_preview: bool,
    /// How targets are chosen.
    #[serde(default)]
    pub targets_mode: TargetsMode,
    /// Explicit target chat IDs (group-class, i.e. negative, only).
    #[serde(default)]
    pub target_chat_ids: Vec<i64>,
    /// One-shot or recurring.
    pub schedule_kind: ScheduleKind,
    /// Fire instant for one-shot items.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    /// Cron expression for recurring items.
    #[serde(default)]
    pub cron: Option<String>,
    /// IANA timezone the cron expression is evaluated in (worker default
    /// when absent).
    #[serde(default)]
    pub tz: Option<String>,
    /// Recurring items stop producing occurrences past this instant.
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Rendering mode for the broadcast text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    Html,
    Plain,
}

/// How the destination set for an item is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetsMode {
    /// Every active group-class chat in the registry.
    #[default]
    All,
    /// The item's own `target_chat_ids` list.
    Explicit,
}

/// One-shot or cron-recurring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Once,
    Cron,
}

/// Item lifecycle status, driven by the poller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Scheduled,
    Processing,
    Done,
    Ended,
    NoTargets,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Ended => "ended",
            Self::NoTargets => "no_targets",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "done" => Self::Done,
            "ended" => Self::Ended,
            "no_targets" => Self::NoTargets,
            "error" => Self::Error,
            _ => Self::Scheduled,
        }
    }
}

impl ScheduledItem {
    /// Create a one-shot item firing at `run_at`.
    pub fn once(title: &str, run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: String::new(),
            media_urls: Vec::new(),
            parse_mode: ParseMode::Html,
            disable_preview: true,
            targets_mode: TargetsMode::All,
            target_chat_ids: Vec::new(),
            schedule_kind: ScheduleKind::Once,
            run_at: Some(run_at),
            cron: None,
            tz: None,
            end_at: None,
            enabled: true,
            status: ItemStatus::Scheduled,
            next_run_at: Some(run_at),
            last_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a cron-recurring item. `next_run_at` starts unset and the
    /// item is not due until a writer arms it via the next-run calculator.
    pub fn cron(title: &str, expression: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: String::new(),
            media_urls: Vec::new(),
            parse_mode: ParseMode::Html,
            disable_preview: true,
            targets_mode: TargetsMode::All,
            target_chat_ids: Vec::new(),
            schedule_kind: ScheduleKind::Cron,
            run_at: None,
            cron: Some(expression.to_string()),
            tz: None,
            end_at: None,
            enabled: true,
            status: ItemStatus::Scheduled,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A record of one attempted send to one chat for one occurrence.
///
/// The `(scheduled_id, chat_id, run_at)` triple is unique in the store and
/// is the sole idempotency guard: the row is inserted once by whichever
/// execution wins the claim, then updated in place to a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub scheduled_id: String,
    pub chat_id: i64,
    /// The occurrence instant this delivery belongs to.
    pub run_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Provider message IDs when sent.
    #[serde(default)]
    pub message_ids: Vec<i64>,
    #[serde(default)]
    pub error: Option<String>,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Delivery outcome. `Claimed` rows with no terminal outcome are ambiguous
/// (the process died mid-send) and are never auto-resent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Claimed,
    Sent,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "error" => Self::Error,
            _ => Self::Claimed,
        }
    }
}

/// A known destination chat. The registry is written by the discovery
/// collaborator; the delivery core only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Canonical chat ID. Group-class chats are negative.
    pub chat_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// The rendered content handed to the send pipeline for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastPayload {
    pub caption: String,
    pub media_urls: Vec<String>,
    pub parse_mode: ParseMode,
    pub disable_preview: bool,
}

impl BroadcastPayload {
    /// Render an item into a payload: `<b>title</b>\ndescription` in HTML
    /// mode, plain concatenation otherwise.
    pub fn from_item(item: &ScheduledItem) -> Self {
        Self {
            caption: build_caption(&item.title, &item.description, item.parse_mode),
            media_urls: item.media_urls.clone(),
            parse_mode: item.parse_mode,
            disable_preview: item.disable_preview,
        }
    }
}

/// Build the caption text for a broadcast.
pub fn build_caption(title: &str, description: &str, mode: ParseMode) -> String {
    let title = title.trim();
    let description = description.trim();
    match mode {
        ParseMode::Html => {
            if description.is_empty() {
                format!("<b>{}</b>", escape_html(title))
            } else {
                format!("<b>{}</b>\n{}", escape_html(title), escape_html(description))
            }
        }
        ParseMode::Plain => {
            if description.is_empty() {
                title.to_string()
            } else {
                format!("{title}\n{description}")
            }
        }
    }
}

/// Minimal HTML escaping for Telegram's HTML parse mode.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse a stored instant. Instants lacking offset information are treated
/// as already being UTC.
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive "YYYY-MM-DDTHH:MM:SS[.fff]", assume UTC
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}
