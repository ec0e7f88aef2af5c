//! Database open/migrate plus scheduled-item and chat-registry access.

use std::path::Path;

use chrono::{DateTime, Utc};
use herald_core::types::parse_instant;
use herald_core::{Chat, HeraldError, ItemStatus, ParseMode, Result, ScheduleKind, ScheduledItem, TargetsMode};

/// SQLite-backed store for all broadcast data.
pub struct BroadcastDb {
    pub(crate) conn: rusqlite::Connection,
}

impl BroadcastDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| HeraldError::store(format!("DB open: {e}")))?;
        // Two workers racing on a claim insert must not abort on a busy lock.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| HeraldError::store(format!("DB busy timeout: {e}")))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables and indexes.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            -- Broadcast items (once or cron)
            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                media_urls TEXT NOT NULL DEFAULT '[]',      -- JSON array
                parse_mode TEXT NOT NULL DEFAULT 'html',
                disable_preview INTEGER NOT NULL DEFAULT 1,
                targets_mode TEXT NOT NULL DEFAULT 'all',   -- 'all' | 'explicit'
                target_chat_ids TEXT NOT NULL DEFAULT '[]', -- JSON array
                schedule_kind TEXT NOT NULL,                -- 'once' | 'cron'
                run_at TEXT,
                cron TEXT,
                tz TEXT,
                end_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT DEFAULT 'scheduled',            -- nullable: legacy rows
                next_run_at TEXT,
                last_run_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_due
                ON scheduled_messages(status, next_run_at);

            -- Delivery claim ledger. One row per (item, chat, occurrence);
            -- the UNIQUE index is the binding idempotency contract.
            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scheduled_id TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'claimed',     -- claimed | sent | error
                message_ids TEXT NOT NULL DEFAULT '[]',     -- JSON array
                error TEXT,
                claimed_at TEXT NOT NULL,
                sent_at TEXT,
                UNIQUE(scheduled_id, chat_id, run_at)
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_item
                ON deliveries(scheduled_id, run_at);

            -- Destination registry (written by discovery, read-only here)
            CREATE TABLE IF NOT EXISTS chats (
                chat_id INTEGER PRIMARY KEY,
                title TEXT,
                kind TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| HeraldError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Scheduled items ──────────────────────────────────────

    /// Insert or replace a scheduled item.
    pub fn save_item(&self, item: &ScheduledItem) -> Result<()> {
        let targets_mode = match item.targets_mode {
            TargetsMode::All => "all",
            TargetsMode::Explicit => "explicit",
        };
        let schedule_kind = match item.schedule_kind {
            ScheduleKind::Once => "once",
            ScheduleKind::Cron => "cron",
        };
        let parse_mode = match item.parse_mode {
            ParseMode::Html => "html",
            ParseMode::Plain => "plain",
        };
        self.conn
            .execute(
                "INSERT OR REPLACE INTO scheduled_messages
                 (id, title, description, media_urls, parse_mode, disable_preview,
                  targets_mode, target_chat_ids, schedule_kind, run_at, cron, tz, end_at,
                  enabled, status, next_run_at, last_run_at, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                rusqlite::params![
                    item.id,
                    item.title,
                    item.description,
                    serde_json::to_string(&item.media_urls)?,
                    parse_mode,
                    item.disable_preview as i32,
                    targets_mode,
                    serde_json::to_string(&item.target_chat_ids)?,
                    schedule_kind,
                    item.run_at.map(|t| t.to_rfc3339()),
                    item.cron,
                    item.tz,
                    item.end_at.map(|t| t.to_rfc3339()),
                    item.enabled as i32,
                    item.status.as_str(),
                    item.next_run_at.map(|t| t.to_rfc3339()),
                    item.last_run_at.map(|t| t.to_rfc3339()),
                    item.last_error,
                    item.created_at.to_rfc3339(),
                    item.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| HeraldError::store(format!("Save item: {e}")))?;
        Ok(())
    }

    /// Fetch one item by ID.
    pub fn get_item(&self, id: &str) -> Result<Option<ScheduledItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM scheduled_messages WHERE id = ?1"))
            .map_err(|e| HeraldError::store(format!("Get item: {e}")))?;
        let mut rows = stmt
            .query_map([id], row_to_item)
            .map_err(|e| HeraldError::store(format!("Get item: {e}")))?;
        match rows.next() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) => Err(HeraldError::store(format!("Get item: {e}"))),
            None => Ok(None),
        }
    }

    /// Items due for dispatch: enabled, in a dispatchable status, and
    /// `next_run_at <= now`. Ordered ascending, capped at `limit`.
    pub fn due_items(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM scheduled_messages
                 WHERE enabled = 1
                   AND (status IN ('scheduled', 'processing') OR status IS NULL)
                   AND next_run_at IS NOT NULL
                   AND next_run_at <= ?1
                 ORDER BY next_run_at ASC
                 LIMIT ?2"
            ))
            .map_err(|e| HeraldError::store(format!("Due query: {e}")))?;
        let rows = stmt
            .query_map(
                rusqlite::params![now.to_rfc3339(), limit],
                row_to_item,
            )
            .map_err(|e| HeraldError::store(format!("Due query: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HeraldError::store(format!("Due query: {e}")))
    }

    /// Transition an item to `processing` and stamp `last_run_at`.
    pub fn mark_processing(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.update_state(
            "status = 'processing', last_run_at = ?2, updated_at = ?2",
            rusqlite::params![id, now.to_rfc3339()],
        )
    }

    /// One-shot item dispatched.
    pub fn mark_done(&self, id: &str) -> Result<()> {
        self.update_state(
            "status = 'done', enabled = 0, updated_at = ?2",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )
    }

    /// Recurring item's cutoff reached; no more occurrences.
    pub fn mark_ended(&self, id: &str) -> Result<()> {
        self.update_state(
            "status = 'ended', enabled = 0, next_run_at = NULL, updated_at = ?2",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )
    }

    /// Resolver produced an empty destination set.
    pub fn mark_no_targets(&self, id: &str) -> Result<()> {
        self.update_state(
            "status = 'no_targets', updated_at = ?2",
            rusqlite::params![id, Utc::now().to_rfc3339()],
        )
    }

    /// Terminal failure (malformed schedule or targeting); never retried
    /// automatically.
    pub fn mark_error(&self, id: &str, error: &str) -> Result<()> {
        self.update_state(
            "status = 'error', enabled = 0, last_error = ?3, updated_at = ?2",
            rusqlite::params![id, Utc::now().to_rfc3339(), error],
        )
    }

    /// Recurring item: persist the next occurrence and re-arm.
    pub fn reschedule(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        self.update_state(
            "status = 'scheduled', next_run_at = ?3, updated_at = ?2",
            rusqlite::params![id, Utc::now().to_rfc3339(), next_run_at.to_rfc3339()],
        )
    }

    // `?1` in params is always the item id
    fn update_state(&self, set_clause: &str, params: impl rusqlite::Params) -> Result<()> {
        self.conn
            .execute(
                &format!("UPDATE scheduled_messages SET {set_clause} WHERE id = ?1"),
                params,
            )
            .map_err(|e| HeraldError::store(format!("Update item: {e}")))?;
        Ok(())
    }

    // ─── Chat registry ──────────────────────────────────────

    /// Active group-class (negative-ID) chats — the "all" targeting snapshot.
    pub fn active_group_chats(&self) -> Result<Vec<Chat>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT chat_id, title, kind, is_active, first_seen_at, last_seen_at
                 FROM chats WHERE is_active = 1 AND chat_id < 0
                 ORDER BY chat_id ASC",
            )
            .map_err(|e| HeraldError::store(format!("Chats query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_chat)
            .map_err(|e| HeraldError::store(format!("Chats query: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HeraldError::store(format!("Chats query: {e}")))
    }

    /// Upsert a chat sighting. Called by the discovery collaborator, not by
    /// the poller.
    pub fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO chats (chat_id, title, kind, is_active, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    title = excluded.title,
                    kind = excluded.kind,
                    is_active = excluded.is_active,
                    last_seen_at = excluded.last_seen_at",
                rusqlite::params![
                    chat.chat_id,
                    chat.title,
                    chat.kind,
                    chat.is_active as i32,
                    chat.first_seen_at.to_rfc3339(),
                    chat.last_seen_at.to_rfc3339(),
                ],
            )
            .map_err(|e| HeraldError::store(format!("Upsert chat: {e}")))?;
        Ok(())
    }
}

const ITEM_COLUMNS: &str = "id, title, description, media_urls, parse_mode, disable_preview, \
     targets_mode, target_chat_ids, schedule_kind, run_at, cron, tz, end_at, \
     enabled, status, next_run_at, last_run_at, last_error, created_at, updated_at";

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledItem> {
    let media_urls: String = row.get(3)?;
    let parse_mode: String = row.get(4)?;
    let targets_mode: String = row.get(6)?;
    let target_chat_ids: String = row.get(7)?;
    let schedule_kind: String = row.get(8)?;
    let status: Option<String> = row.get(14)?;
    Ok(ScheduledItem {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        media_urls: serde_json::from_str(&media_urls).unwrap_or_default(),
        parse_mode: if parse_mode == "plain" {
            ParseMode::Plain
        } else {
            ParseMode::Html
        },
        disable_preview: row.get::<_, i32>(5)? != 0,
        targets_mode: if targets_mode == "explicit" {
            TargetsMode::Explicit
        } else {
            TargetsMode::All
        },
        target_chat_ids: serde_json::from_str(&target_chat_ids).unwrap_or_default(),
        schedule_kind: if schedule_kind == "cron" {
            ScheduleKind::Cron
        } else {
            ScheduleKind::Once
        },
        run_at: get_instant(row, 9)?,
        cron: row.get(10)?,
        tz: row.get(11)?,
        end_at: get_instant(row, 12)?,
        enabled: row.get::<_, i32>(13)? != 0,
        status: ItemStatus::parse(status.as_deref().unwrap_or("scheduled")),
        next_run_at: get_instant(row, 15)?,
        last_run_at: get_instant(row, 16)?,
        last_error: row.get(17)?,
        created_at: get_instant(row, 18)?.unwrap_or_else(Utc::now),
        updated_at: get_instant(row, 19)?.unwrap_or_else(Utc::now),
    })
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        chat_id: row.get(0)?,
        title: row.get(1)?,
        kind: row.get(2)?,
        is_active: row.get::<_, i32>(3)? != 0,
        first_seen_at: get_instant(row, 4)?.unwrap_or_else(Utc::now),
        last_seen_at: get_instant(row, 5)?.unwrap_or_else(Utc::now),
    })
}

pub(crate) fn get_instant(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_instant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn open_test_db(name: &str) -> (tempfile::TempDir, BroadcastDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = BroadcastDb::open(&dir.path().join(name)).unwrap();
        (dir, db)
    }

    #[test]
    fn test_save_and_load_item() {
        let (_dir, db) = open_test_db("roundtrip.db");
        let mut item = ScheduledItem::once("launch", Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap());
        item.description = "big day".into();
        item.media_urls = vec!["https://example.com/a.png".into()];
        item.targets_mode = TargetsMode::Explicit;
        item.target_chat_ids = vec![-100, -200];
        db.save_item(&item).unwrap();

        let loaded = db.get_item(&item.id).unwrap().unwrap();
        assert_eq!(loaded.title, "launch");
        assert_eq!(loaded.target_chat_ids, vec![-100, -200]);
        assert_eq!(loaded.media_urls.len(), 1);
        assert_eq!(loaded.schedule_kind, ScheduleKind::Once);
        assert_eq!(loaded.run_at, item.run_at);
    }

    #[test]
    fn test_due_items_filters_and_orders() {
        let (_dir, db) = open_test_db("due.db");
        let now = Utc::now();

        let later = ScheduledItem::once("later", now - Duration::minutes(1));
        let earlier = ScheduledItem::once("earlier", now - Duration::minutes(10));
        let future = ScheduledItem::once("future", now + Duration::hours(1));
        let mut disabled = ScheduledItem::once("disabled", now - Duration::minutes(5));
        disabled.enabled = false;
        let mut done = ScheduledItem::once("done", now - Duration::minutes(5));
        done.status = ItemStatus::Done;
        done.enabled = false;

        for item in [&later, &earlier, &future, &disabled, &done] {
            db.save_item(item).unwrap();
        }

        let due = db.due_items(now, 25).unwrap();
        let titles: Vec<_> = due.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["earlier", "later"]);
    }

    #[test]
    fn test_due_items_batch_cap() {
        let (_dir, db) = open_test_db("cap.db");
        let now = Utc::now();
        for i in 0..30 {
            let item = ScheduledItem::once(&format!("item-{i}"), now - Duration::minutes(1));
            db.save_item(&item).unwrap();
        }
        assert_eq!(db.due_items(now, 25).unwrap().len(), 25);
    }

    #[test]
    fn test_state_transitions() {
        let (_dir, db) = open_test_db("state.db");
        let now = Utc::now();
        let item = ScheduledItem::once("x", now - Duration::minutes(1));
        db.save_item(&item).unwrap();

        db.mark_processing(&item.id, now).unwrap();
        let got = db.get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Processing);
        assert!(got.last_run_at.is_some());

        db.mark_done(&item.id).unwrap();
        let got = db.get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Done);
        assert!(!got.enabled);

        db.mark_error(&item.id, "bad cron").unwrap();
        let got = db.get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Error);
        assert_eq!(got.last_error.as_deref(), Some("bad cron"));
        assert!(!got.enabled);
    }

    #[test]
    fn test_mark_ended_clears_next_run() {
        let (_dir, db) = open_test_db("ended.db");
        let item = ScheduledItem::cron("weekly", "0 9 * * 1");
        db.save_item(&item).unwrap();
        db.mark_ended(&item.id).unwrap();
        let got = db.get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Ended);
        assert!(got.next_run_at.is_none());
        assert!(!got.enabled);
    }

    #[test]
    fn test_active_group_chats_excludes_users_and_inactive() {
        let (_dir, db) = open_test_db("chats.db");
        let now = Utc::now();
        let mk = |id: i64, active: bool| Chat {
            chat_id: id,
            title: None,
            kind: None,
            is_active: active,
            first_seen_at: now,
            last_seen_at: now,
        };
        db.upsert_chat(&mk(-300, true)).unwrap();
        db.upsert_chat(&mk(-100, true)).unwrap();
        db.upsert_chat(&mk(-200, false)).unwrap();
        db.upsert_chat(&mk(55, true)).unwrap();

        let chats = db.active_group_chats().unwrap();
        let ids: Vec<_> = chats.iter().map(|c| c.chat_id).collect();
        assert_eq!(ids, vec![-300, -100]);
    }
}
