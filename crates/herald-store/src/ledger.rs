//! Delivery claim ledger — the idempotency primitive.
//!
//! A claim is an atomic insert-if-absent against the unique
//! `(scheduled_id, chat_id, run_at)` index. Exactly one execution wins a
//! given triple; losers skip silently. The winner must eventually record a
//! terminal outcome on the same row.

use chrono::{DateTime, Utc};
use herald_core::{Delivery, DeliveryStatus, HeraldError, Result};

use crate::db::{get_instant, BroadcastDb};

/// Outcome of a claim attempt. `Lost` is expected under concurrent dispatch
/// and is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Won,
    Lost,
}

impl BroadcastDb {
    /// Atomically claim the right to deliver one (item, chat, occurrence)
    /// triple. The unique index decides the race; no lock is involved.
    pub fn claim(
        &self,
        scheduled_id: &str,
        chat_id: i64,
        run_at: DateTime<Utc>,
    ) -> Result<Claim> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO deliveries (scheduled_id, chat_id, run_at, status, message_ids, claimed_at)
                 VALUES (?1, ?2, ?3, 'claimed', '[]', ?4)
                 ON CONFLICT(scheduled_id, chat_id, run_at) DO NOTHING",
                rusqlite::params![
                    scheduled_id,
                    chat_id,
                    run_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| HeraldError::store(format!("Claim: {e}")))?;
        Ok(if inserted == 1 { Claim::Won } else { Claim::Lost })
    }

    /// Record a successful send on a claimed row.
    pub fn record_sent(
        &self,
        scheduled_id: &str,
        chat_id: i64,
        run_at: DateTime<Utc>,
        message_ids: &[i64],
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deliveries
                 SET status = 'sent', message_ids = ?4, sent_at = ?5
                 WHERE scheduled_id = ?1 AND chat_id = ?2 AND run_at = ?3",
                rusqlite::params![
                    scheduled_id,
                    chat_id,
                    run_at.to_rfc3339(),
                    serde_json::to_string(message_ids)?,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| HeraldError::store(format!("Record sent: {e}")))?;
        Ok(())
    }

    /// Record a failed send on a claimed row.
    pub fn record_error(
        &self,
        scheduled_id: &str,
        chat_id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deliveries
                 SET status = 'error', error = ?4, sent_at = ?5
                 WHERE scheduled_id = ?1 AND chat_id = ?2 AND run_at = ?3",
                rusqlite::params![
                    scheduled_id,
                    chat_id,
                    run_at.to_rfc3339(),
                    error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| HeraldError::store(format!("Record error: {e}")))?;
        Ok(())
    }

    /// All delivery rows for one item, newest occurrence first.
    pub fn deliveries_for(&self, scheduled_id: &str) -> Result<Vec<Delivery>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, scheduled_id, chat_id, run_at, status, message_ids, error, claimed_at, sent_at
                 FROM deliveries WHERE scheduled_id = ?1
                 ORDER BY run_at DESC, chat_id ASC",
            )
            .map_err(|e| HeraldError::store(format!("Deliveries query: {e}")))?;
        let rows = stmt
            .query_map([scheduled_id], row_to_delivery)
            .map_err(|e| HeraldError::store(format!("Deliveries query: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HeraldError::store(format!("Deliveries query: {e}")))
    }

    /// Claims stuck without a terminal outcome for longer than the given
    /// cutoff. Ambiguous delivery state: the operator decides what to do.
    /// These rows are never resent automatically.
    pub fn abandoned_deliveries(&self, older_than: DateTime<Utc>) -> Result<Vec<Delivery>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, scheduled_id, chat_id, run_at, status, message_ids, error, claimed_at, sent_at
                 FROM deliveries
                 WHERE status = 'claimed' AND claimed_at < ?1
                 ORDER BY claimed_at ASC",
            )
            .map_err(|e| HeraldError::store(format!("Abandoned query: {e}")))?;
        let rows = stmt
            .query_map([older_than.to_rfc3339()], row_to_delivery)
            .map_err(|e| HeraldError::store(format!("Abandoned query: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HeraldError::store(format!("Abandoned query: {e}")))
    }
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    let status: String = row.get(4)?;
    let message_ids: String = row.get(5)?;
    Ok(Delivery {
        id: row.get(0)?,
        scheduled_id: row.get(1)?,
        chat_id: row.get(2)?,
        run_at: get_instant(row, 3)?.unwrap_or_else(Utc::now),
        status: DeliveryStatus::parse(&status),
        message_ids: serde_json::from_str(&message_ids).unwrap_or_default(),
        error: row.get(6)?,
        claimed_at: get_instant(row, 7)?.unwrap_or_else(Utc::now),
        sent_at: get_instant(row, 8)?,
    })
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

    fn occurrence() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_first_claim_wins_rest_lose() {
        let (_dir, db) = open_test_db("claims.db");
        let run_at = occurrence();
        assert_eq!(db.claim("item-1", -100, run_at).unwrap(), Claim::Won);
        for _ in 0..4 {
            assert_eq!(db.claim("item-1", -100, run_at).unwrap(), Claim::Lost);
        }
        assert_eq!(db.deliveries_for("item-1").unwrap().len(), 1);
    }

    #[test]
    fn test_claims_race_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let db_a = BroadcastDb::open(&path).unwrap();
        let db_b = BroadcastDb::open(&path).unwrap();
        let run_at = occurrence();

        let a = db_a.claim("item-1", -100, run_at).unwrap();
        let b = db_b.claim("item-1", -100, run_at).unwrap();
        assert_eq!(a, Claim::Won);
        assert_eq!(b, Claim::Lost);
    }

    #[test]
    fn test_distinct_triples_are_independent() {
        let (_dir, db) = open_test_db("triples.db");
        let run_at = occurrence();
        assert_eq!(db.claim("item-1", -100, run_at).unwrap(), Claim::Won);
        assert_eq!(db.claim("item-1", -200, run_at).unwrap(), Claim::Won);
        assert_eq!(db.claim("item-2", -100, run_at).unwrap(), Claim::Won);
        // Next occurrence of the same pairing is a fresh triple
        let next = run_at + Duration::days(1);
        assert_eq!(db.claim("item-1", -100, next).unwrap(), Claim::Won);
    }

    #[test]
    fn test_terminal_outcomes() {
        let (_dir, db) = open_test_db("outcomes.db");
        let run_at = occurrence();
        db.claim("item-1", -100, run_at).unwrap();
        db.record_sent("item-1", -100, run_at, &[42, 43]).unwrap();

        db.claim("item-1", -200, run_at).unwrap();
        db.record_error("item-1", -200, run_at, "flood wait exceeded")
            .unwrap();

        let rows = db.deliveries_for("item-1").unwrap();
        assert_eq!(rows.len(), 2);
        let sent = rows.iter().find(|d| d.chat_id == -100).unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.message_ids, vec![42, 43]);
        assert!(sent.sent_at.is_some());
        let failed = rows.iter().find(|d| d.chat_id == -200).unwrap();
        assert_eq!(failed.status, DeliveryStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("flood wait exceeded"));
    }

    #[test]
    fn test_terminal_row_still_blocks_reclaim() {
        let (_dir, db) = open_test_db("reclaim.db");
        let run_at = occurrence();
        db.claim("item-1", -100, run_at).unwrap();
        db.record_sent("item-1", -100, run_at, &[7]).unwrap();
        assert_eq!(db.claim("item-1", -100, run_at).unwrap(), Claim::Lost);
    }

    #[test]
    fn test_abandoned_listing() {
        let (_dir, db) = open_test_db("abandoned.db");
        let run_at = occurrence();
        db.claim("item-1", -100, run_at).unwrap();
        db.claim("item-1", -200, run_at).unwrap();
        db.record_sent("item-1", -200, run_at, &[1]).unwrap();

        // Only the still-claimed row shows up, and only past the cutoff
        let stale = db
            .abandoned_deliveries(Utc::now() + Duration::minutes(10))
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].chat_id, -100);

        let fresh = db
            .abandoned_deliveries(Utc::now() - Duration::minutes(10))
            .unwrap();
        assert!(fresh.is_empty());
    }
}
