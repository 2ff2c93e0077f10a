//! 🧠 The in-memory store — every trait, one mutex, zero disks.
//!
//! It holds all your rules and alerts, beautifully, until the process ends
//! and takes everything with it like a sandcastle at high tide. 🌊
//!
//! 🧠 Knowledge graph: ONE `Mutex` around ONE `State` struct. That is not
//! laziness, that is the cascade guarantee — `delete` removes a rule and its
//! alerts inside a single critical section, so no reader ever observes an
//! orphaned alert. A real database store would use a transaction; we use the
//! poor man's transaction, and it is airtight for the same reason.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::common::{
    Alert, AlertStatus, DataSource, NotificationChannel, RetentionConfig, RetentionStatus, Rule,
};
use crate::stores::{AlertStore, ChannelStore, RetentionStore, RuleStore, SourceStore};

#[derive(Debug, Default)]
struct State {
    rules: HashMap<i64, Rule>,
    alerts: HashMap<i64, Alert>,
    sources: HashMap<i64, DataSource>,
    channels: HashMap<i64, NotificationChannel>,
    retention: Option<RetentionConfig>,
    next_alert_id: i64,
}

/// 🧪 The all-in-one in-memory store. Implements every store trait, shares
/// one lock, and exposes a handful of inherent helpers for seeding and
/// asserting in tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- 🧪 seeding & inspection helpers — test scaffolding, not a store trait

    /// 🌱 Insert or replace a rule wholesale. Test/seed path only — the
    /// engine never writes whole rules.
    pub async fn put_rule(&self, rule: Rule) {
        self.state.lock().await.rules.insert(rule.id, rule);
    }

    pub async fn put_source(&self, source: DataSource) {
        self.state.lock().await.sources.insert(source.id, source);
    }

    pub async fn put_channel(&self, channel: NotificationChannel) {
        self.state.lock().await.channels.insert(channel.id, channel);
    }

    /// 🔍 Peek at a rule's current statistics without going through the trait.
    pub async fn rule(&self, id: i64) -> Option<Rule> {
        self.state.lock().await.rules.get(&id).cloned()
    }

    /// 🔍 All alerts belonging to one rule, oldest first by ID.
    pub async fn alerts_for_rule(&self, rule_id: i64) -> Vec<Alert> {
        let state = self.state.lock().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.id);
        alerts
    }

    pub async fn alert_total(&self) -> usize {
        self.state.lock().await.alerts.len()
    }

    /// 🌱 Backdate-friendly alert seeding for retention tests.
    pub async fn put_alert(&self, alert: Alert) -> i64 {
        let mut state = self.state.lock().await;
        state.next_alert_id += 1;
        let id = state.next_alert_id;
        state.alerts.insert(id, Alert { id, ..alert });
        id
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn get_enabled_ids(&self) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        let mut ids: Vec<i64> = state
            .rules
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get(&self, id: i64) -> Result<Option<Rule>> {
        Ok(self.state.lock().await.rules.get(&id).cloned())
    }

    async fn update_last_run_time(&self, id: i64, t: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.rules.get_mut(&id) {
            rule.last_run_time = Some(t);
        }
        Ok(())
    }

    async fn increment_run_count(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.rules.get_mut(&id) {
            rule.run_count += 1;
        }
        Ok(())
    }

    async fn increment_alert_count(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.rules.get_mut(&id) {
            rule.alert_count += 1;
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        // 🗑️ One critical section = the cascade is atomic. No reader sees a
        // deleted rule's alerts, not even for a nanosecond.
        let mut state = self.state.lock().await;
        state.rules.remove(&id);
        state.alerts.retain(|_, alert| alert.rule_id != id);
        Ok(())
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    async fn create(&self, alert: Alert) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_alert_id += 1;
        let id = state.next_alert_id;
        state.alerts.insert(id, Alert { id, ..alert });
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: AlertStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(alert) = state.alerts.get_mut(&id) {
            alert.status = status;
            alert.error = error;
        }
        Ok(())
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.alerts.len();
        state.alerts.retain(|_, alert| alert.created_at >= cutoff);
        Ok((before - state.alerts.len()) as u64)
    }
}

#[async_trait]
impl SourceStore for InMemoryStore {
    async fn get(&self, id: i64) -> Result<Option<DataSource>> {
        Ok(self.state.lock().await.sources.get(&id).cloned())
    }
}

#[async_trait]
impl ChannelStore for InMemoryStore {
    async fn get(&self, id: i64) -> Result<Option<NotificationChannel>> {
        Ok(self.state.lock().await.channels.get(&id).cloned())
    }
}

#[async_trait]
impl RetentionStore for InMemoryStore {
    async fn get(&self) -> Result<RetentionConfig> {
        Ok(self
            .state
            .lock()
            .await
            .retention
            .clone()
            .unwrap_or_default())
    }

    async fn update_config(&self, cfg: RetentionConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        // 🚦 Read-modify-write: the incoming config's status fields are
        // whatever the caller happened to have loaded — we overwrite them
        // with the worker's current truth before storing.
        let current = state.retention.clone().unwrap_or_default();
        state.retention = Some(RetentionConfig {
            last_execution_status: current.last_execution_status,
            last_execution_time: current.last_execution_time,
            last_execution_result: current.last_execution_result,
            ..cfg
        });
        Ok(())
    }

    async fn update_execution_status(
        &self,
        status: RetentionStatus,
        time: DateTime<Utc>,
        result: String,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut cfg = state.retention.clone().unwrap_or_default();
        cfg.last_execution_status = status;
        cfg.last_execution_time = Some(time);
        cfg.last_execution_result = Some(result);
        state.retention = Some(cfg);
        Ok(())
    }
}
