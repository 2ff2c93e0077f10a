//! 🚨 klaxon — the core library crate, the beating heart, the engine room
//! where log lines become alerts and alerts become someone's 3am problem.
//!
//! 📦 This crate contains the scheduler, the evaluator, the notifier, the
//! cleanup worker, and all the existential dread that comes with paging
//! humans for a living. 🦆
//!
//! 🧠 Knowledge graph — the life of one rule tick:
//! ```text
//! Scheduler → Evaluator → (Query Builder → SearchClient) → persist Alert
//!                                                  ↘ Notifier (detached) → status update
//! ```
//! The scheduler owns rule lifetimes. The evaluator is a pure operation
//! invoked under a concurrency slot. The notifier is fire-and-forget *after
//! persistence* — but the slot rides along until it settles.
//!
//! ⚠️ "The singularity will happen before this crate reaches 1.0"

pub mod app_config;
pub mod cleanup;
pub(crate) mod common;
pub(crate) mod errors;
pub mod evaluator;
pub mod notify;
pub(crate) mod query;
pub(crate) mod search;
pub mod scheduler;
pub mod stores;

// 🎯 Re-export the types external layers actually touch, so callers can do
// `klaxon::Rule` instead of spelunking into module paths.
pub use common::{
    Alert, AlertStatus, DataSource, Logic, NotificationChannel, QueryCondition, RetentionConfig,
    RetentionStatus, Rule,
};
pub use errors::ExecError;
pub use scheduler::SchedulerHandle;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app_config::{AppConfig, WorkerSettings};
use crate::cleanup::CleanupWorker;
use crate::evaluator::Evaluator;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::stores::Stores;

/// 🚀 The grand entry point. The big kahuna. The main event.
///
/// Validates the config (the only fatal moment in this crate's life), wires
/// the evaluator + scheduler + cleanup worker against the given stores,
/// then runs until ctrl-c and drains on the way out.
///
/// 🎫 The [`SchedulerHandle`] is minted here and handed to whatever outer
/// layer needs to poke rules (the HTTP API, in the full deployment) — the
/// scheduler itself stays private to this function. No process-wide
/// singleton, no reaching into globals from handlers. Construction is the
/// dependency injection.
pub async fn run(config: AppConfig, stores: Stores) -> Result<()> {
    config
        .validate()
        .context("💀 startup config validation failed — fix the environment and come back")?;
    let settings = WorkerSettings::from(&config);

    info!("🚨 KLAXON IS WAKING UP — rules will be evaluated, webhooks will be bothered");

    let notifier = Notifier::new(settings.retry_times)
        .context("💀 Failed to construct the webhook notifier")?;
    let evaluator = Evaluator::new(stores.clone(), notifier, settings.clone());
    let mut scheduler = Scheduler::new(evaluator, stores.clone(), settings.clone());
    let _handle: SchedulerHandle = scheduler.handle();

    if settings.enabled {
        scheduler.start();
    } else {
        // WORKER_ENABLED=false: config-only mode. The API surface (out of
        // this crate) still works; nothing ticks.
        info!("😴 WORKER_ENABLED=false — scheduler stays in bed");
    }

    // 🗑️ the cleanup worker runs either way — retention is not optional
    // just because evaluation is paused
    let cleanup_cancel = CancellationToken::new();
    let cleanup = CleanupWorker::new(stores.clone(), cleanup_cancel.clone());
    let cleanup_handle = tokio::spawn(cleanup.run());

    // 🛑 park here until the operator says otherwise
    tokio::signal::ctrl_c()
        .await
        .context("💀 Failed to listen for ctrl-c — the shutdown signal has no mailbox")?;
    info!("🛑 shutdown signal received — draining");

    scheduler.stop().await;
    cleanup_cancel.cancel();
    let _ = cleanup_handle.await;

    info!("🎉 clean shutdown — every task landed, every permit came home 🦆");
    Ok(())
}
