//! Target resolver — pure function from item + registry snapshot to the
//! ordered destination set for one occurrence.
//!
//! Output is deduplicated and ascending-sorted so that partial-failure
//! resume walks destinations in the same order every time.

use std::collections::BTreeSet;

use herald_core::{Chat, HeraldError, Result, ScheduledItem, TargetsMode};

/// Resolve the destination chat IDs for one occurrence of `item`.
///
/// Explicit lists may only contain group-class (negative) IDs; a positive
/// ID is a configuration error, surfaced rather than silently dropped.
pub fn resolve_targets(item: &ScheduledItem, chats: &[Chat]) -> Result<Vec<i64>> {
    match item.targets_mode {
        TargetsMode::Explicit => {
            if let Some(bad) = item.target_chat_ids.iter().find(|id| **id >= 0) {
                return Err(HeraldError::targeting(format!(
                    "target {bad} is not a group-class chat id"
                )));
            }
            let ids: BTreeSet<i64> = item.target_chat_ids.iter().copied().collect();
            Ok(ids.into_iter().collect())
        }
        TargetsMode::All => {
            let ids: BTreeSet<i64> = chats
                .iter()
                .filter(|c| c.is_active && c.chat_id < 0)
                .map(|c| c.chat_id)
                .collect();
            Ok(ids.into_iter().collect())
        }
    }
}
