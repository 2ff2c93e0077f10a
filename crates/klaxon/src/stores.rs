//! 🗃️ Stores — the seams where the engine meets persistence.
//!
//! 🎭 This module is the casting agency. Need rules loaded fresh every tick?
//! Alerts persisted with a cascade on rule deletion? A retention config that
//! survives config edits without losing its status fields? We've got a trait
//! for that. We've got traits for days.
//!
//! 📜 Contract notes that matter more than they look:
//! - The engine only *reads* rule config; the config CRUD surface (out of
//!   scope here) is the single writer. Statistics go the other way — the
//!   evaluator owns them, via the dedicated increment/update operations
//!   below, which are atomic at the storage layer. No read-modify-write of
//!   whole rules, ever, or the two writers start overwriting each other.
//! - `RuleStore::delete` must cascade to the rule's alerts *atomically* —
//!   it's the one place a transaction is genuinely required.
//! - `RetentionStore::update_config` must preserve the three execution
//!   status fields. The cleanup worker writes them; user edits don't own them.
//!
//! 🦆 The duck is here because every module must have one. This is law.

pub(crate) mod in_mem;

pub use in_mem::InMemoryStore;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::{
    Alert, AlertStatus, DataSource, NotificationChannel, RetentionConfig, RetentionStatus, Rule,
};

/// 📦 Rule persistence — fresh reads per tick, atomic statistic writes.
#[async_trait]
pub trait RuleStore: Send + Sync + std::fmt::Debug {
    /// 🔍 IDs of all currently enabled rules. The reconcile loop's worldview.
    async fn get_enabled_ids(&self) -> Result<Vec<i64>>;
    /// 📄 One rule by ID, or `None` if it was deleted out from under us.
    async fn get(&self, id: i64) -> Result<Option<Rule>>;
    /// ⏱️ The durable window-cursor advance. Serialized per rule by the
    /// one-task-per-rule structure, so no compare-and-swap needed.
    async fn update_last_run_time(&self, id: i64, t: DateTime<Utc>) -> Result<()>;
    /// 🔢 `run_count += 1`, atomic at the storage layer.
    async fn increment_run_count(&self, id: i64) -> Result<()>;
    /// 🔢 `alert_count += 1`, atomic at the storage layer. Called only after
    /// a notification actually lands.
    async fn increment_alert_count(&self, id: i64) -> Result<()>;
    /// 🗑️ Delete the rule AND its alerts, atomically. The cascade is the point.
    async fn delete(&self, id: i64) -> Result<()>;
}

/// 🚨 Alert persistence.
#[async_trait]
pub trait AlertStore: Send + Sync + std::fmt::Debug {
    /// 🗃️ Persist a new alert, returning its assigned ID.
    async fn create(&self, alert: Alert) -> Result<i64>;
    /// 🚦 Flip delivery status after the webhook settles, one way or the other.
    async fn update_status(
        &self,
        id: i64,
        status: AlertStatus,
        error: Option<String>,
    ) -> Result<()>;
    /// 🗑️ Hard-delete alerts created before `cutoff`. Returns the body count.
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 📡 Data-source lookups, for rules that link one.
#[async_trait]
pub trait SourceStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, id: i64) -> Result<Option<DataSource>>;
}

/// 🔔 Notification-channel lookups, for rules that link one.
#[async_trait]
pub trait ChannelStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, id: i64) -> Result<Option<NotificationChannel>>;
}

/// 🗑️ The retention singleton.
#[async_trait]
pub trait RetentionStore: Send + Sync + std::fmt::Debug {
    /// 📄 The config, with defaults materialized if nothing was ever saved.
    async fn get(&self) -> Result<RetentionConfig>;
    /// 🔧 User-facing config write. MUST read-modify-write so the three
    /// execution-status fields survive the edit untouched.
    async fn update_config(&self, cfg: RetentionConfig) -> Result<()>;
    /// 🚦 Worker-facing status write. Touches ONLY the three status fields.
    async fn update_execution_status(
        &self,
        status: RetentionStatus,
        time: DateTime<Utc>,
        result: String,
    ) -> Result<()>;
}

/// 🎒 The whole persistence kit, one `Arc` per concern, cheap to clone.
///
/// 🧠 Knowledge graph: the engine takes `Stores` everywhere instead of five
/// separate generics — trait objects at the seam, concrete stores behind
/// them. [`Stores::in_memory`] wires every seam to one shared
/// [`InMemoryStore`], which is what the tests and the embedded CLI run use.
#[derive(Debug, Clone)]
pub struct Stores {
    pub rules: Arc<dyn RuleStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub sources: Arc<dyn SourceStore>,
    pub channels: Arc<dyn ChannelStore>,
    pub retention: Arc<dyn RetentionStore>,
}

impl Stores {
    /// 🧪 Everything backed by one in-memory store. Lives and dies with the
    /// process. No persistence. No regrets. No disk. Very YOLO.
    pub fn in_memory() -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let stores = Self {
            rules: store.clone(),
            alerts: store.clone(),
            sources: store.clone(),
            channels: store.clone(),
            retention: store.clone(),
        };
        (stores, store)
    }
}
