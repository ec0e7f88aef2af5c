//! Next-run calculator — pure function from schedule definition to the next
//! due instant.
//!
//! Cron expressions are evaluated in the item's timezone (falling back to
//! the worker default) and the result converted to UTC; all other
//! arithmetic stays in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use herald_core::{HeraldError, Result, ScheduleKind, ScheduledItem};

/// Compute the next occurrence of `item` strictly after `now`.
///
/// Returns `Ok(None)` when the schedule has no more occurrences (cutoff
/// reached), a terminal state. Missing required timing fields or a
/// malformed expression are configuration errors, never retried.
pub fn next_occurrence(
    item: &ScheduledItem,
    now: DateTime<Utc>,
    default_tz: &str,
) -> Result<Option<DateTime<Utc>>> {
    match item.schedule_kind {
        ScheduleKind::Once => {
            // The poller's due-check decides whether a past instant fires;
            // this function reports it unconditionally.
            let run_at = item
                .run_at
                .or(item.next_run_at)
                .ok_or_else(|| HeraldError::schedule("once item has no run_at"))?;
            if let Some(end) = item.end_at {
                if run_at > end {
                    return Ok(None);
                }
            }
            Ok(Some(run_at))
        }
        ScheduleKind::Cron => {
            let expression = item
                .cron
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| HeraldError::schedule("cron item has no expression"))?;
            let tz_name = item.tz.as_deref().unwrap_or(default_tz);
            let tz: Tz = tz_name
                .parse()
                .map_err(|_| HeraldError::schedule(format!("unknown timezone '{tz_name}'")))?;
            let cron = Cron::new(expression)
                .parse()
                .map_err(|e| HeraldError::schedule(format!("bad cron '{expression}': {e}")))?;

            let local_now = now.with_timezone(&tz);
            let next_local = cron
                .find_next_occurrence(&local_now, false)
                .map_err(|e| HeraldError::schedule(format!("cron '{expression}': {e}")))?;
            let next_utc = next_local.with_timezone(&Utc);
            if let Some(end) = item.end_at {
                if next_utc > end {
                    return Ok(None);
                }
            }
            Ok(Some(next_utc))
        }
    }
}
