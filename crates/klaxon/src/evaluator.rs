//! ⚙️ The evaluator — one rule, one tick, one pass through the pipeline.
//!
//! 🎬 *[a rule is loaded. a window is computed. Elasticsearch is consulted.]*
//! *[the cursor advances. an alert is born. a webhook is dialed.]*
//! *[the semaphore slot watches the whole thing, and only then clocks out.]*
//!
//! 📜 The tick, in order, with the load-bearing details spelled out:
//!
//! 1. **Gate** — unforced ticks that arrive before `interval` has elapsed
//!    since `last_run_time` are skipped with zero side effects.
//! 2. **Window** — `to = now`; `from = last_run_time − 2s`, or `now − 5min`
//!    on the very first run. The 2-second back-overlap is deliberate and
//!    non-negotiable: without it, a document timestamped in the sliver
//!    between "query sent" and "cursor committed" falls between two windows
//!    and nobody ever alerts on it. Two seconds of double-checking beats a
//!    lost page. Windows are additionally capped at 1 hour so a rule that
//!    slept for three weeks doesn't wake up and demand a three-week scan.
//! 3. **Webhook** — linked channel first (if present AND enabled), inline
//!    URL second, `Config` error if both come up empty. No query runs for a
//!    rule with nowhere to report.
//! 4. **Client** — linked data source (must be enabled), else the
//!    process-wide default, else `Config` error.
//! 5. **Query** — scroll-paginated fetch, cancellation-aware.
//! 6. **Commit** — `last_run_time = to`, synchronously, match or no match.
//!    This is the durable window advance. If the write fails we log and
//!    keep going — the alert still goes out, the next tick re-covers.
//! 7. **run_count += 1** — best-effort.
//! 8. Zero matches → done.
//! 9. **Persist** — alert with ≤50 sampled logs and the true match count.
//! 10. **Dispatch** — detached task: ≤10 logs transmitted, send budget
//!     enforced, retries inside. Status and `alert_count` settle there.
//!     The semaphore permit rides along and releases only when the send
//!     settles — `WORKER_MAX_CONCURRENCY` is a ceiling on outbound load,
//!     not just on queries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_config::WorkerSettings;
use crate::common::{Alert, AlertStatus, DataSource, Rule, format_time_range};
use crate::errors::ExecError;
use crate::notify::Notifier;
use crate::search::SearchClient;
use crate::stores::Stores;

/// 🕰️ The back-overlap between consecutive windows. See the module docs —
/// this constant has prevented more incident reports than any dashboard.
const BACK_OVERLAP: ChronoDuration = ChronoDuration::seconds(2);

/// 🕰️ Window for a rule that has never run: the last five minutes.
const FIRST_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

/// 🕰️ Ceiling on any single window. A rule re-enabled after weeks gets the
/// last hour, not the whole archaeology dig.
const MAX_WINDOW: ChronoDuration = ChronoDuration::hours(1);

/// 📏 At most this many logs ride in the webhook payload.
const MAX_TRANSMIT_LOGS: usize = 10;

/// 🎯 What one tick amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// ⏭️ Interval gate said "not yet". Nothing happened. Nothing at all.
    Skipped,
    /// 📭 Queried clean. Cursor advanced, run counted, no alert.
    NoMatch,
    /// 🚨 Matches found — alert persisted, notification dispatched.
    Alerted { log_count: u64 },
}

/// 🕰️ Pure window math, split out so the tests can pin exact timestamps
/// without fighting the wall clock.
pub(crate) fn resolve_window(
    last_run_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let to = now;
    let mut from = match last_run_time {
        Some(t) => t - BACK_OVERLAP,
        None => now - FIRST_WINDOW,
    };
    if to - from > MAX_WINDOW {
        from = to - MAX_WINDOW;
    }
    (from, to)
}

/// ⚙️ The per-tick execution pipeline. Stateless between ticks on purpose —
/// everything it knows it just read from the stores, so config edits land
/// on the very next tick without any cache-invalidation folklore.
#[derive(Debug, Clone)]
pub struct Evaluator {
    stores: Stores,
    notifier: Notifier,
    settings: WorkerSettings,
}

impl Evaluator {
    pub fn new(stores: Stores, notifier: Notifier, settings: WorkerSettings) -> Self {
        Self {
            stores,
            notifier,
            settings,
        }
    }

    /// 🎬 Run one tick for `rule`. The caller holds a semaphore permit and
    /// hands it over; it releases when the tick — including any detached
    /// notification — has fully settled.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        rule: &Rule,
        force: bool,
        permit: OwnedSemaphorePermit,
    ) -> Result<TickOutcome, ExecError> {
        let now = Utc::now();

        // 1️⃣ the interval gate — forced executions walk right past it
        if !force {
            if let Some(last_run) = rule.last_run_time {
                let since = (now - last_run).to_std().unwrap_or_default();
                if since < rule.effective_interval() {
                    return Ok(TickOutcome::Skipped);
                }
            }
        }

        // 2️⃣ the window
        let (from, to) = resolve_window(rule.last_run_time, now);

        // 3️⃣ somewhere to report, or nothing to do
        let webhook_url = self.resolve_webhook(rule).await?;

        // 4️⃣ someone to ask
        let source = self.resolve_source(rule).await?;
        let client = SearchClient::from_source(&source, self.settings.es_query_timeout)?;

        // 5️⃣ the question itself — dropped mid-flight if we get cancelled
        let logs = tokio::select! {
            result = client.query_logs(rule, from, to, self.settings.batch_size) => result?,
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        };

        // 6️⃣ the durable advance. Synchronous, unconditional, and allowed to
        // fail without taking the alert down with it.
        if let Err(e) = self.stores.rules.update_last_run_time(rule.id, to).await {
            warn!("⏱️ rule '{}': cursor write failed ({e}) — alert proceeds anyway", rule.name);
        }

        // 7️⃣ best-effort bookkeeping
        if let Err(e) = self.stores.rules.increment_run_count(rule.id).await {
            warn!("🔢 rule '{}': run_count increment failed: {e}", rule.name);
        }

        // 8️⃣ a clean window is the happy path
        if logs.is_empty() {
            debug!("📭 rule '{}': window [{from} .. {to}) came back clean", rule.name);
            return Ok(TickOutcome::NoMatch);
        }

        let log_count = logs.len() as u64;
        let time_range = format_time_range(from, to);
        info!("🚨 rule '{}': {log_count} matching logs in [{from} .. {to})", rule.name);

        // 9️⃣ persist — true count, bounded sample, optimistic `sent` status
        let index_name = logs[0]
            .get("_index")
            .and_then(Value::as_str)
            .unwrap_or(&rule.index_pattern)
            .to_string();
        let stored_sample: Vec<Value> =
            logs.iter().take(Alert::MAX_STORED_LOGS).cloned().collect();
        let alert = Alert {
            id: 0,
            rule_id: rule.id,
            index_name,
            log_count,
            logs: stored_sample,
            time_range: time_range.clone(),
            status: AlertStatus::Sent,
            error: None,
            created_at: now,
        };
        let alert_id = match self.stores.alerts.create(alert).await {
            Ok(id) => Some(id),
            Err(e) => {
                // 🗃️ persistence down ≠ notification down. The on-call human
                // still gets paged; only the paper trail suffers.
                warn!("{}", ExecError::PersistFailed(e.to_string()));
                None
            }
        };

        // 🔟 dispatch, detached — the permit moves in and holds the slot
        // until the webhook settles, one way or the other
        self.dispatch_notification(
            cancel.clone(),
            permit,
            rule.clone(),
            webhook_url,
            logs,
            log_count,
            time_range,
            alert_id,
        );

        Ok(TickOutcome::Alerted { log_count })
    }

    /// 🔔 Spawn the detached send task: budget on the outside, retry ladder
    /// on the inside, status + `alert_count` settled at the end.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_notification(
        &self,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
        rule: Rule,
        webhook_url: String,
        logs: Vec<Value>,
        log_count: u64,
        time_range: String,
        alert_id: Option<i64>,
    ) {
        let notifier = self.notifier.clone();
        let stores = self.stores.clone();
        let send_timeout = self.settings.send_timeout;
        let transmit: Vec<Value> = logs.into_iter().take(MAX_TRANSMIT_LOGS).collect();

        tokio::spawn(async move {
            // 🧵 the slot lives exactly as long as this task
            let _slot = permit;

            let verdict = match tokio::time::timeout(
                send_timeout,
                notifier.send_alert(&cancel, &webhook_url, &rule, &transmit, log_count, &time_range),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(ExecError::SendTimeout(send_timeout)),
            };

            match verdict {
                Ok(()) => {
                    if let Some(id) = alert_id {
                        if let Err(e) = stores.alerts.update_status(id, AlertStatus::Sent, None).await
                        {
                            warn!("🚦 alert {id}: status write failed after send: {e}");
                        }
                        // 🔢 one successful *send* = one alert_count tick.
                        // Unpersisted alerts don't count — there's no record
                        // for the number to describe.
                        if let Err(e) = stores.rules.increment_alert_count(rule.id).await {
                            warn!("🔢 rule '{}': alert_count increment failed: {e}", rule.name);
                        }
                    }
                    info!("✅ rule '{}': alert delivered", rule.name);
                }
                Err(e) => {
                    warn!("🔔 rule '{}': notification settled as failure: {e}", rule.name);
                    if let Some(id) = alert_id {
                        if let Err(write_err) = stores
                            .alerts
                            .update_status(id, AlertStatus::Failed, Some(e.to_string()))
                            .await
                        {
                            warn!("🚦 alert {id}: failure-status write failed too: {write_err}");
                        }
                    }
                }
            }
        });
    }

    /// 🔔 Channel first (present AND enabled AND non-empty), inline second.
    async fn resolve_webhook(&self, rule: &Rule) -> Result<String, ExecError> {
        if let Some(channel_id) = rule.channel_id {
            let channel = self
                .stores
                .channels
                .get(channel_id)
                .await
                .map_err(|e| ExecError::Config(format!("channel lookup failed: {e}")))?;
            if let Some(channel) = channel {
                if channel.enabled && !channel.webhook_url.trim().is_empty() {
                    return Ok(channel.webhook_url);
                }
                // disabled or empty channel — fall through to the inline URL
            }
        }
        match rule.webhook_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => Err(ExecError::Config(format!(
                "rule '{}' has no webhook anywhere — no enabled channel, no inline URL",
                rule.name
            ))),
        }
    }

    /// 📡 Linked source (must exist, must be enabled) or the process default.
    async fn resolve_source(&self, rule: &Rule) -> Result<DataSource, ExecError> {
        if let Some(source_id) = rule.data_source_id {
            let source = self
                .stores
                .sources
                .get(source_id)
                .await
                .map_err(|e| ExecError::Config(format!("data source lookup failed: {e}")))?;
            return match source {
                Some(source) if source.enabled => Ok(source),
                Some(source) => Err(ExecError::Config(format!(
                    "rule '{}' links data source '{}', which is disabled",
                    rule.name, source.name
                ))),
                None => Err(ExecError::Config(format!(
                    "rule '{}' links data source {source_id}, which does not exist",
                    rule.name
                ))),
            };
        }
        self.settings.default_source.clone().ok_or_else(|| {
            ExecError::Config(format!(
                "rule '{}' links no data source and there is no process-wide default",
                rule.name
            ))
        })
    }
}
