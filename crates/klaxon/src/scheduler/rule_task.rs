//! 🧵 Rule tasks: the backbone of the scheduler, the unsung heroes, the ones
//! who actually tick while the reconcile loop takes all the credit in the
//! sprint retro.
//!
//! 📜 The lifecycle of one task, cradle to grave:
//! 1. **Force-execute immediately** — a freshly enabled rule fires now, not
//!    `interval` seconds from now. Humans who just clicked "enable" are
//!    watching the screen. Make it do something.
//! 2. **Tick** at `max(interval, 10s)`. Every tick reloads the rule from
//!    the store — live config edits land on the very next tick, and an
//!    interval change resets the ticker on the spot.
//! 3. **Exit** when the token says so: rule disabled, or scheduler shutdown.
//!
//! ⚠️ There is exactly one of these per rule. That sentence is the entire
//! serial-per-rule guarantee. No lock. No CAS. Just arithmetic: one task,
//! one rule, zero overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{MIN_INTERVAL_SECS, Rule};
use crate::errors::ExecError;
use crate::evaluator::{Evaluator, TickOutcome};
use crate::stores::Stores;

/// 🏁 The per-rule loop. Spawned by the reconciler, cancelled by the
/// reconciler, mourned by no one.
pub(super) async fn run(
    rule_id: i64,
    evaluator: Arc<Evaluator>,
    stores: Stores,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    debug!("🏁 rule {rule_id}: task starting");

    // 1️⃣ immediate forced tick, so "enable" means "now"
    let mut current_interval = match load(&stores, rule_id).await {
        Some(rule) => {
            let interval = rule.effective_interval();
            execute_under_slot(&evaluator, &semaphore, &cancel, &rule, true).await;
            interval
        }
        // rule vanished between reconcile and spawn — idle at the floor
        // interval until the next reconcile reaps this task
        None => Duration::from_secs(MIN_INTERVAL_SECS),
    };

    // ⏱️ interval_at: first tick one full period from now — the forced
    // execution above already covered "now"
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + current_interval,
        current_interval,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // 2️⃣ fresh read every tick — the store is the truth
                let Some(rule) = load(&stores, rule_id).await else {
                    continue;
                };
                let interval = rule.effective_interval();
                if interval != current_interval {
                    debug!(
                        "⏱️ rule {rule_id}: interval {current_interval:?} → {interval:?}, ticker reset"
                    );
                    current_interval = interval;
                    ticker = tokio::time::interval_at(
                        tokio::time::Instant::now() + interval,
                        interval,
                    );
                }
                execute_under_slot(&evaluator, &semaphore, &cancel, &rule, false).await;
            }
            _ = cancel.cancelled() => {
                debug!("🛑 rule {rule_id}: task exiting");
                return;
            }
        }
    }
}

/// 🎟️ Acquire a concurrency slot (or give up if shutdown wins the race),
/// run one tick, log the outcome per policy. The permit moves into the
/// evaluator, which holds it through any detached notification.
pub(super) async fn execute_under_slot(
    evaluator: &Evaluator,
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
    rule: &Rule,
    force: bool,
) {
    let permit = tokio::select! {
        permit = semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            // semaphore closed = scheduler torn down
            Err(_) => return,
        },
        _ = cancel.cancelled() => return,
    };

    match evaluator.execute(cancel, rule, force, permit).await {
        Ok(TickOutcome::Skipped) => {}
        Ok(TickOutcome::NoMatch) => {}
        Ok(TickOutcome::Alerted { log_count }) => {
            info!("🚨 rule '{}': tick produced an alert ({log_count} logs)", rule.name);
        }
        Err(ExecError::Cancelled) => {
            debug!("🛑 rule '{}': tick cancelled mid-flight", rule.name);
        }
        // Config and QueryFailed both land here: logged, cursor frozen,
        // next tick gets another shot
        Err(e) => warn!("⚠️ rule '{}': tick failed: {e}", rule.name),
    }
}

async fn load(stores: &Stores, rule_id: i64) -> Option<Rule> {
    match stores.rules.get(rule_id).await {
        Ok(rule) => rule,
        Err(e) => {
            warn!("📄 rule {rule_id}: reload failed ({e}) — skipping this tick");
            None
        }
    }
}
