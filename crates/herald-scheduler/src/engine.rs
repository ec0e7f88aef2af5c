//! Poller engine — finds due items once per tick and drives each one
//! through claim, delivery and state recomputation.
//!
//! Failure isolation: a destination failure is recorded on that delivery
//! row only; an item failure (bad schedule, bad targeting) disables that
//! item only; nothing aborts the tick.

use chrono::{DateTime, Utc};
use herald_core::{BroadcastPayload, Deliver, Result, ScheduleKind, ScheduledItem};
use herald_store::{BroadcastDb, Claim};

use crate::nextrun::next_occurrence;
use crate::targets::resolve_targets;

/// The scheduler poller — owns the item state machine.
pub struct Poller<D: Deliver> {
    db: BroadcastDb,
    deliverer: D,
    batch_size: u32,
    default_tz: String,
}

impl<D: Deliver> Poller<D> {
    pub fn new(db: BroadcastDb, deliverer: D, batch_size: u32, default_tz: &str) -> Self {
        Self {
            db,
            deliverer,
            batch_size,
            default_tz: default_tz.to_string(),
        }
    }

    pub fn db(&self) -> &BroadcastDb {
        &self.db
    }

    /// Run one poll tick to completion. Returns the number of due items
    /// examined.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.db.due_items(now, self.batch_size)?;
        let count = due.len();
        for item in due {
            if let Err(e) = self.process_item(&item, now).await {
                // Store-level failure for one item; the rest of the tick
                // continues.
                tracing::error!("Item '{}' tick failed: {e}", item.id);
            }
        }
        Ok(count)
    }

    async fn process_item(&self, item: &ScheduledItem, now: DateTime<Utc>) -> Result<()> {
        // The stored due instant is the occurrence key, so cron repeats get
        // a fresh claim triple and restarts reuse the old one.
        let run_at = item.next_run_at.unwrap_or(now);
        self.db.mark_processing(&item.id, now)?;

        let chats = self.db.active_group_chats()?;
        let targets = match resolve_targets(item, &chats) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Item '{}' rejected: {e}", item.id);
                self.db.mark_error(&item.id, &e.to_string())?;
                return Ok(());
            }
        };
        if targets.is_empty() {
            tracing::info!("Item '{}' has no targets", item.id);
            self.db.mark_no_targets(&item.id)?;
            return Ok(());
        }

        let payload = BroadcastPayload::from_item(item);
        for chat_id in targets {
            match self.db.claim(&item.id, chat_id, run_at) {
                Ok(Claim::Won) => match self.deliverer.deliver(chat_id, &payload).await {
                    Ok(message_ids) => {
                        self.db.record_sent(&item.id, chat_id, run_at, &message_ids)?;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Delivery failed item='{}' chat={chat_id}: {e}",
                            item.id
                        );
                        self.db.record_error(&item.id, chat_id, run_at, &e.to_string())?;
                    }
                },
                Ok(Claim::Lost) => {
                    tracing::debug!(
                        "Claim lost item='{}' chat={chat_id} run_at={run_at}, skipping",
                        item.id
                    );
                }
                Err(e) => {
                    // Cannot prove we own the triple; do not send.
                    tracing::warn!("Claim failed item='{}' chat={chat_id}: {e}", item.id);
                }
            }
        }

        match item.schedule_kind {
            ScheduleKind::Once => self.db.mark_done(&item.id)?,
            ScheduleKind::Cron => match next_occurrence(item, now, &self.default_tz) {
                Ok(Some(next)) => {
                    tracing::info!("Item '{}' rescheduled for {next}", item.id);
                    self.db.reschedule(&item.id, next)?;
                }
                Ok(None) => {
                    tracing::info!("Item '{}' reached its cutoff, ended", item.id);
                    self.db.mark_ended(&item.id)?;
                }
                Err(e) => {
                    tracing::warn!("Item '{}' schedule is invalid: {e}", item.id);
                    self.db.mark_error(&item.id, &e.to_string())?;
                }
            },
        }
        Ok(())
    }
}

/// Spawnable poll loop: one tick runs to completion, then the loop sleeps
/// for `poll_interval` and re-queries.
pub async fn run_poller<D: Deliver>(poller: Poller<D>, poll_interval: std::time::Duration) {
    tracing::info!("⏰ Poller started (tick every {:?})", poll_interval);
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match poller.tick().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Tick processed {n} due item(s)"),
            Err(e) => tracing::error!("Tick failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use herald_core::{Chat, DeliveryStatus, HeraldError, ItemStatus, TargetsMode};
    use std::sync::Mutex;

    struct MockDeliver {
        calls: Mutex<Vec<i64>>,
        fail_chats: Vec<i64>,
    }

    impl MockDeliver {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_chats: Vec::new(),
            }
        }

        fn failing_for(chats: Vec<i64>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_chats: chats,
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Deliver for MockDeliver {
        async fn deliver(&self, chat_id: i64, _payload: &BroadcastPayload) -> Result<Vec<i64>> {
            self.calls.lock().unwrap().push(chat_id);
            if self.fail_chats.contains(&chat_id) {
                Err(HeraldError::transport("mock send failure"))
            } else {
                Ok(vec![9000 + chat_id.abs()])
            }
        }
    }

    fn test_poller(name: &str, deliverer: MockDeliver) -> (tempfile::TempDir, Poller<MockDeliver>) {
        let dir = tempfile::tempdir().unwrap();
        let db = BroadcastDb::open(&dir.path().join(name)).unwrap();
        (dir, Poller::new(db, deliverer, 25, "UTC"))
    }

    fn past_due_once(targets: Vec<i64>) -> ScheduledItem {
        let mut item = ScheduledItem::once("launch", Utc::now() - Duration::minutes(5));
        item.targets_mode = TargetsMode::Explicit;
        item.target_chat_ids = targets;
        item
    }

    #[tokio::test]
    async fn test_once_item_delivers_to_both_targets_then_done() {
        let (_dir, poller) = test_poller("once.db", MockDeliver::new());
        let item = past_due_once(vec![-100, -200]);
        poller.db().save_item(&item).unwrap();

        assert_eq!(poller.tick().await.unwrap(), 1);

        let rows = poller.db().deliveries_for(&item.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|d| d.status == DeliveryStatus::Sent));
        assert!(rows.iter().all(|d| !d.message_ids.is_empty()));

        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Done);
        assert!(!got.enabled);
        // Ascending dispatch order
        assert_eq!(poller.deliverer.calls(), vec![-200, -100]);
    }

    #[tokio::test]
    async fn test_done_item_produces_no_new_rows_on_retick() {
        let (_dir, poller) = test_poller("retick.db", MockDeliver::new());
        let item = past_due_once(vec![-100, -200]);
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();
        assert_eq!(poller.db().deliveries_for(&item.id).unwrap().len(), 2);

        assert_eq!(poller.tick().await.unwrap(), 0);
        assert_eq!(poller.db().deliveries_for(&item.id).unwrap().len(), 2);
        assert_eq!(poller.deliverer.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_explicit_target_rejected_before_dispatch() {
        let (_dir, poller) = test_poller("badtarget.db", MockDeliver::new());
        let item = past_due_once(vec![-100, 55]);
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();

        assert!(poller.deliverer.calls().is_empty());
        assert!(poller.db().deliveries_for(&item.id).unwrap().is_empty());
        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Error);
        assert!(!got.enabled);
        assert!(got.last_error.unwrap().contains("55"));
    }

    #[tokio::test]
    async fn test_empty_registry_marks_no_targets() {
        let (_dir, poller) = test_poller("notargets.db", MockDeliver::new());
        let mut item = past_due_once(vec![]);
        item.targets_mode = TargetsMode::All;
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();

        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::NoTargets);
        // Stalls without being disabled: fixing targets re-arms it
        assert!(got.enabled);
        assert!(poller.deliverer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_all_mode_uses_active_group_registry() {
        let (_dir, poller) = test_poller("allmode.db", MockDeliver::new());
        let now = Utc::now();
        for (id, active) in [(-100, true), (-200, true), (-300, false), (77, true)] {
            poller
                .db()
                .upsert_chat(&Chat {
                    chat_id: id,
                    title: None,
                    kind: None,
                    is_active: active,
                    first_seen_at: now,
                    last_seen_at: now,
                })
                .unwrap();
        }
        let mut item = past_due_once(vec![]);
        item.targets_mode = TargetsMode::All;
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();
        assert_eq!(poller.deliverer.calls(), vec![-200, -100]);
    }

    #[tokio::test]
    async fn test_lost_claim_skips_destination_silently() {
        let (_dir, poller) = test_poller("lostclaim.db", MockDeliver::new());
        let item = past_due_once(vec![-100, -200]);
        poller.db().save_item(&item).unwrap();

        // Another execution already owns (-100) for this occurrence
        let run_at = item.next_run_at.unwrap();
        poller.db().claim(&item.id, -100, run_at).unwrap();

        poller.tick().await.unwrap();

        assert_eq!(poller.deliverer.calls(), vec![-200]);
        let rows = poller.db().deliveries_for(&item.id).unwrap();
        assert_eq!(rows.len(), 2);
        let stolen = rows.iter().find(|d| d.chat_id == -100).unwrap();
        assert_eq!(stolen.status, DeliveryStatus::Claimed); // untouched
        let sent = rows.iter().find(|d| d.chat_id == -200).unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_destination_failure_does_not_block_siblings() {
        let (_dir, poller) = test_poller("isolate.db", MockDeliver::failing_for(vec![-200]));
        let item = past_due_once(vec![-100, -200]);
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();

        let rows = poller.db().deliveries_for(&item.id).unwrap();
        let failed = rows.iter().find(|d| d.chat_id == -200).unwrap();
        assert_eq!(failed.status, DeliveryStatus::Error);
        let sent = rows.iter().find(|d| d.chat_id == -100).unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        // Item still completes its state transition
        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn test_cron_item_reschedules_after_dispatch() {
        let (_dir, poller) = test_poller("cron.db", MockDeliver::new());
        let mut item = ScheduledItem::cron("hourly", "0 * * * *");
        item.targets_mode = TargetsMode::Explicit;
        item.target_chat_ids = vec![-100];
        item.next_run_at = Some(Utc::now() - Duration::minutes(1));
        poller.db().save_item(&item).unwrap();

        let before = Utc::now();
        poller.tick().await.unwrap();

        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Scheduled);
        assert!(got.enabled);
        assert!(got.next_run_at.unwrap() > before);
        assert_eq!(poller.db().deliveries_for(&item.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cron_cutoff_transitions_to_ended() {
        let (_dir, poller) = test_poller("cutoff.db", MockDeliver::new());
        let mut item = ScheduledItem::cron("daily", "0 9 * * *");
        item.targets_mode = TargetsMode::Explicit;
        item.target_chat_ids = vec![-100];
        item.next_run_at = Some(Utc::now() - Duration::minutes(1));
        item.end_at = Some(Utc::now()); // next occurrence is past the cutoff
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();

        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Ended);
        assert!(got.next_run_at.is_none());
        assert!(!got.enabled);
        // The final occurrence before the cutoff still went out
        assert_eq!(poller.db().deliveries_for(&item.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_cron_disables_item() {
        let (_dir, poller) = test_poller("badcron.db", MockDeliver::new());
        let mut item = ScheduledItem::cron("bad", "61 25 * * *");
        item.targets_mode = TargetsMode::Explicit;
        item.target_chat_ids = vec![-100];
        item.next_run_at = Some(Utc::now() - Duration::minutes(1));
        poller.db().save_item(&item).unwrap();

        poller.tick().await.unwrap();

        let got = poller.db().get_item(&item.id).unwrap().unwrap();
        assert_eq!(got.status, ItemStatus::Error);
        assert!(!got.enabled);
        assert!(got.last_error.is_some());
    }
}
