//! 🗑️ The cleanup worker — a daily sweep with a sixty-second heartbeat.
//!
//! 🎬 *[03:00 local time. the office is dark. somewhere, a worker wakes,
//! checks its watch, and quietly deletes last week's alerts.]*
//!
//! 📜 How the schedule actually works (it's subtler than "run at 3am"):
//! - The worker ticks every 60 seconds, forever. Each tick it re-reads the
//!   retention config — enable/disable and time edits land within a minute,
//!   no restart, no signal, no drama.
//! - When enabled, it computes the next local-time occurrence of
//!   `(hour, minute)`; if that minute already passed today, tomorrow's it.
//! - The trigger comparison is minute-truncated on BOTH sides: the sweep
//!   fires on the tick where the current minute reaches the scheduled
//!   minute, wherever inside that minute the tick lands.
//! - After a sweep (success or failure), the next run is tomorrow at the
//!   same local time, and the three execution-status fields are written.
//!
//! The manual trigger path ([`run_retention_now`]) is the SAME delete and
//! the SAME status write — the external API calls it directly, with zero
//! coupling to the scheduled tick.

use chrono::{DateTime, Local, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ExecError;
use crate::stores::Stores;
use crate::common::RetentionStatus;

/// ⏱️ Heartbeat cadence. Also the worst-case latency for noticing a config
/// edit or a due sweep.
const CLEANUP_TICK: Duration = Duration::from_secs(60);

/// 🗑️ The retention sweep loop. One per process, spawned next to the
/// scheduler, cancelled with the same root token at shutdown.
pub struct CleanupWorker {
    stores: Stores,
    cancel: CancellationToken,
}

impl CleanupWorker {
    pub fn new(stores: Stores, cancel: CancellationToken) -> Self {
        Self { stores, cancel }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(CLEANUP_TICK);
        // the schedule we last derived, and the (hour, minute) it came from —
        // a config edit to either field re-derives on the next heartbeat
        let mut next_run: Option<DateTime<Local>> = None;
        let mut derived_from: (u32, u32) = (u32::MAX, u32::MAX);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cfg = match self.stores.retention.get().await {
                        Ok(cfg) => cfg,
                        Err(e) => {
                            warn!("🗑️ retention config unreadable, idling this tick: {e}");
                            continue;
                        }
                    };

                    if !cfg.enabled {
                        // disabled = fully dormant; forget the schedule so a
                        // re-enable derives a fresh one
                        next_run = None;
                        derived_from = (u32::MAX, u32::MAX);
                        continue;
                    }

                    if next_run.is_none() || derived_from != (cfg.hour, cfg.minute) {
                        derived_from = (cfg.hour, cfg.minute);
                        let scheduled = next_occurrence(Local::now(), cfg.hour, cfg.minute);
                        info!("🗑️ next retention sweep: {}", scheduled.format("%Y-%m-%d %H:%M"));
                        next_run = Some(scheduled);
                    }

                    if let Some(due) = next_run {
                        if truncate_to_minute(Local::now()) >= truncate_to_minute(due) {
                            // outcome already logged + recorded inside
                            let _ = run_retention_now(&self.stores).await;
                            next_run = Some(due + chrono::Duration::days(1));
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!("🗑️ cleanup worker exiting");
                    return;
                }
            }
        }
    }
}

/// 🗑️ One retention sweep, usable from the scheduled tick AND the manual
/// API trigger. Deletes alerts older than `retention_days`, then records
/// the outcome in the three execution-status fields.
pub async fn run_retention_now(stores: &Stores) -> Result<u64, ExecError> {
    let cfg = stores
        .retention
        .get()
        .await
        .map_err(|e| ExecError::CleanupFailed(format!("retention config unreadable: {e}")))?;

    let days = cfg.retention_days.max(1);
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));

    match stores.alerts.cleanup_older_than(cutoff).await {
        Ok(deleted) => {
            let message = if deleted > 0 {
                format!("成功删除 {deleted} 条告警数据")
            } else {
                "没有需要清理的数据".to_string()
            };
            info!("🗑️ retention sweep done: {message}");
            if let Err(e) = stores
                .retention
                .update_execution_status(RetentionStatus::Success, Utc::now(), message)
                .await
            {
                warn!("🚦 retention status write failed after a clean sweep: {e}");
            }
            Ok(deleted)
        }
        Err(e) => {
            let failure = e.to_string();
            warn!("💀 retention sweep failed: {failure}");
            if let Err(write_err) = stores
                .retention
                .update_execution_status(RetentionStatus::Failed, Utc::now(), failure.clone())
                .await
            {
                warn!("🚦 retention status write failed on top of the sweep failing: {write_err}");
            }
            Err(ExecError::CleanupFailed(failure))
        }
    }
}

/// 🕰️ The next local-time occurrence of `(hour, minute)`: today if that
/// minute hasn't passed yet (the current minute counts as "not passed"),
/// otherwise tomorrow.
fn next_occurrence(now: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    let today = local_at(now, now.date_naive(), hour, minute);
    if truncate_to_minute(today) >= truncate_to_minute(now) {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// 🕰️ `(date, hour, minute)` → local DateTime, with out-of-range components
/// clamped and DST weirdness resolved pragmatically.
fn local_at(now: DateTime<Local>, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Local> {
    let Some(naive) = date.and_hms_opt(hour.min(23), minute.min(59), 0) else {
        // unreachable with clamped components; fall back to "now" regardless
        return now;
    };
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        // fall-back transition: the wall time exists twice — take the first
        LocalResult::Ambiguous(earliest, _) => earliest,
        // spring-forward hole: the wall time doesn't exist — run at the next
        // heartbeat instead of never
        LocalResult::None => now,
    }
}

fn truncate_to_minute(t: DateTime<Local>) -> DateTime<Local> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Alert, AlertStatus, RetentionConfig};
    use crate::stores::Stores;
    use chrono::Datelike;
    use serde_json::json;

    fn old_alert(rule_id: i64, age_days: i64) -> Alert {
        Alert {
            id: 0,
            rule_id,
            index_name: "app-2024.02.01".into(),
            log_count: 1,
            logs: vec![json!({"message": "ancient history"})],
            time_range: "whenever".into(),
            status: AlertStatus::Sent,
            error: None,
            created_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    #[test]
    fn the_one_where_the_schedule_knows_what_day_it_is() {
        // 🕰️ mid-day timestamps on purpose — no DST cliffs in this test
        let at = |h, m| Local.with_ymd_and_hms(2024, 6, 5, h, m, 30).unwrap();

        // before the scheduled minute → today
        let next = next_occurrence(at(2, 59), 3, 0);
        assert_eq!((next.day(), next.hour(), next.minute()), (5, 3, 0));

        // exactly the scheduled minute → today (fires now)
        let next = next_occurrence(at(3, 0), 3, 0);
        assert_eq!((next.day(), next.hour(), next.minute()), (5, 3, 0));

        // one minute past → tomorrow
        let next = next_occurrence(at(3, 1), 3, 0);
        assert_eq!((next.day(), next.hour(), next.minute()), (6, 3, 0));

        // late evening, early-morning schedule → tomorrow
        let next = next_occurrence(at(23, 30), 3, 0);
        assert_eq!((next.day(), next.hour(), next.minute()), (6, 3, 0));
    }

    #[tokio::test]
    async fn the_one_where_forty_two_old_alerts_meet_their_retention() {
        // 🧪 Scenario: 42 alerts past the 7-day line, one fresh bystander.
        let (stores, store) = Stores::in_memory();
        for _ in 0..42 {
            store.put_alert(old_alert(1, 10)).await;
        }
        store.put_alert(old_alert(1, 2)).await;

        let mut cfg = RetentionConfig::default();
        cfg.enabled = true;
        cfg.retention_days = 7;
        stores.retention.update_config(cfg).await.unwrap();

        let deleted = run_retention_now(&stores).await.unwrap();
        assert_eq!(deleted, 42);
        assert_eq!(store.alert_total().await, 1);

        let cfg = stores.retention.get().await.unwrap();
        assert_eq!(cfg.last_execution_status, RetentionStatus::Success);
        assert_eq!(cfg.last_execution_result.as_deref(), Some("成功删除 42 条告警数据"));
        assert!(cfg.last_execution_time.is_some());
    }

    #[tokio::test]
    async fn the_one_where_there_was_nothing_to_bury() {
        let (stores, store) = Stores::in_memory();
        store.put_alert(old_alert(1, 1)).await;

        let deleted = run_retention_now(&stores).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.alert_total().await, 1);
        let cfg = stores.retention.get().await.unwrap();
        assert_eq!(cfg.last_execution_status, RetentionStatus::Success);
        assert_eq!(cfg.last_execution_result.as_deref(), Some("没有需要清理的数据"));
    }

    #[tokio::test]
    async fn the_one_where_a_disabled_config_means_a_very_lazy_worker() {
        // 😴 enabled=false → the worker ticks, reads, and does nothing
        let (stores, store) = Stores::in_memory();
        store.put_alert(old_alert(1, 30)).await;
        // default config is disabled — no update needed

        let cancel = CancellationToken::new();
        let worker = CleanupWorker::new(stores.clone(), cancel.clone());
        let handle = tokio::spawn(worker.run());

        // the first interval tick fires immediately; give it a moment
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.alert_total().await, 1, "disabled worker must not delete");
        let cfg = stores.retention.get().await.unwrap();
        assert_eq!(cfg.last_execution_status, RetentionStatus::Never);
    }

    #[tokio::test]
    async fn the_one_where_the_scheduled_minute_arrives_and_the_broom_moves() {
        // 🧪 The scheduled-tick path end to end: schedule for the current
        // local minute, let the worker's first heartbeat notice it's due.
        // (If we're in the last seconds of a minute, wait out the rollover —
        // scheduling "this minute" as it dies makes the test lie.)
        if Local::now().second() >= 56 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let now = Local::now();

        let (stores, store) = Stores::in_memory();
        for _ in 0..3 {
            store.put_alert(old_alert(1, 30)).await;
        }
        let mut cfg = RetentionConfig::default();
        cfg.enabled = true;
        cfg.hour = now.hour();
        cfg.minute = now.minute();
        cfg.retention_days = 7;
        stores.retention.update_config(cfg).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = CleanupWorker::new(stores.clone(), cancel.clone());
        let handle = tokio::spawn(worker.run());

        // first heartbeat is immediate; the sweep should land fast
        let mut swept = false;
        for _ in 0..100 {
            if stores.retention.get().await.unwrap().last_execution_status
                == RetentionStatus::Success
            {
                swept = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(swept, "the scheduled sweep never fired");
        assert_eq!(store.alert_total().await, 0);
        assert_eq!(
            stores.retention.get().await.unwrap().last_execution_result.as_deref(),
            Some("成功删除 3 条告警数据")
        );
    }
}
