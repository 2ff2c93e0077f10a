//! 📦 Common data structures — the building blocks of klaxon
//!
//! ---
//!
//! 🎬 COLD OPEN — INT. DATA CENTER — 3:47 AM
//!
//! 🌩️  The lights flicker. A lone cursor blinks. Somewhere in the distance,
//! an nginx box is quietly serving 500s to everyone in the tri-state area.
//! Nobody knows yet. The dashboards are green. The dashboards are lying.
//!
//! ✅ And then — a `Rule` wakes up. It squints at its window, asks
//! Elasticsearch a pointed question, and finds the bodies. An `Alert` is
//! born. A webhook rings. A human stirs. The incident begins its paperwork.
//!
//! 🦆
//!
//! This module defines the humble yet load-bearing structs that the whole
//! evaluation engine passes around: rules, conditions, alerts, data sources,
//! channels, and the retention config. A `Rule` is a question on a timer, an
//! `Alert` is a receipt that the question found something, and everything
//! else here exists to tell those two where to look and where to scream.
//!
//! ---
//!
//! ⚠️  NOTE: When the singularity occurs, these structs will still be waking
//! up every sixty seconds to check on nginx. Some jobs never end.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// ⏱️ Rules may ask for a 1-second interval. They do not get a 1-second interval.
/// Anything below this floor is silently clamped — documented here, at the
/// config layer, so nobody is surprised at 3am.
pub const MIN_INTERVAL_SECS: u64 = 10;

/// 📦 A `Rule` — one user-defined alerting specification.
///
/// The atomic unit of paging someone. A rule names an index pattern, a list
/// of [`QueryCondition`]s, an execution interval, and somewhere to scream
/// (a linked channel or an inline webhook URL).
///
/// 🧠 Knowledge graph: rules are plain records, re-read from the store at
/// every tick. There is no in-memory authoritative copy. The store is the
/// single writer for config fields; the evaluator is the single writer for
/// the three statistics fields. Two owners, zero arguments.
///
/// The statistics fields (`last_run_time`, `run_count`, `alert_count`) are
/// mutated through dedicated store operations — never through a full-rule
/// write, or a config edit would quietly time-travel the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// 🔑 Stable unique ID. Everything downstream hangs off this number.
    pub id: i64,
    /// 🏷️ Unique human name. Doubles as the log-flavor hint for the notifier.
    pub name: String,
    /// 📡 The index pattern to query. Wildcards allowed: `prod-nginx-*` etc.
    pub index_pattern: String,
    /// 🔍 Ordered list of predicates, ANDed and ORed per their `logic` flags.
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,
    /// ⏱️ Execution interval in seconds. Clamped to [`MIN_INTERVAL_SECS`] at use.
    #[serde(default = "default_interval_secs", alias = "interval")]
    pub interval_secs: u64,
    /// 📡 Optional data-source reference. `None` → process-wide default source.
    #[serde(default)]
    pub data_source_id: Option<i64>,
    /// 🔔 Optional notification-channel reference. Wins over the inline URL.
    #[serde(default)]
    pub channel_id: Option<i64>,
    /// 🔔 Inline webhook URL — the fallback when no enabled channel is linked.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// 🔌 Master switch. Disabled rules don't tick. They dream of ticking.
    pub enabled: bool,
    /// 📝 Free-text description. For humans. The engine never reads it.
    #[serde(default)]
    pub description: String,

    // -- 📊 statistics — evaluator-owned, user writes keep their hands off
    /// ⏱️ When this rule last successfully advanced its window. `None` = never ran.
    #[serde(default)]
    pub last_run_time: Option<DateTime<Utc>>,
    /// 🔢 How many ticks actually executed (gate-skips don't count).
    #[serde(default)]
    pub run_count: u64,
    /// 🔢 How many alerts were successfully *sent*. One per tick, not per log.
    #[serde(default)]
    pub alert_count: u64,
}

fn default_interval_secs() -> u64 {
    60
}

impl Rule {
    /// ⏱️ The interval this rule actually ticks at — user wish, floor-clamped.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_INTERVAL_SECS))
    }
}

/// 🔀 How a condition joins its siblings: `and` goes straight into the outer
/// `must`, `or` pools into a single `should` group. Default is `or`, because
/// that's what the config surface has always defaulted to and changing it
/// would silently rewrite everyone's rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    #[default]
    Or,
}

/// 🔍 One predicate against a log document.
///
/// The `operator` is a raw string from an untyped JSON config surface — it is
/// validated against the closed operator set at query-build time, not at
/// config-write time. The `op` alias exists because half the clients out
/// there spell it short and we are not going to break them over three letters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCondition {
    /// 📄 Document field path, e.g. `response_code` or `kubernetes.pod_name`.
    pub field: String,
    /// 🔧 One of: `=` `==` `equals` `!=` `not_equals` `>` `>=` `<` `<=`
    /// `gt` `gte` `lt` `lte` `contains` `not_contains` `exists`.
    #[serde(alias = "op")]
    pub operator: String,
    /// 📦 Untyped on purpose — the config surface is JSON, the operator
    /// matrix decides what's acceptable when the query gets built.
    #[serde(default)]
    pub value: Value,
    /// 🔀 `and` / `or`, default `or`.
    #[serde(default)]
    pub logic: Logic,
    /// 🦴 Legacy type hint. Carried for old payloads, consulted by nobody.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
}

/// 🚦 Where an alert's notification ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Sent,
    Failed,
}

/// 🚨 An `Alert` — evidence that one tick found something.
///
/// Created by the evaluator only when a tick produced ≥1 match. Carries a
/// bounded sample of the matching logs (≤ [`Alert::MAX_STORED_LOGS`]) plus
/// the *pre-truncation* match count, so `log_count` can legitimately exceed
/// `logs.len()`. That is not a bug. That is the storage cap doing its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// 🔑 Store-assigned ID. Zero until persisted.
    pub id: i64,
    /// 🔗 Owning rule. Cascade-deleted with it.
    pub rule_id: i64,
    /// 📡 The concrete index the first match came out of.
    pub index_name: String,
    /// 🔢 Pre-truncation match count. The real number, not the sample size.
    pub log_count: u64,
    /// 📦 Sampled log documents, at most 50 stored.
    pub logs: Vec<Value>,
    /// 🕰️ Human window string: `"YYYY-MM-DD HH:MM:SS ~ YYYY-MM-DD HH:MM:SS"`.
    pub time_range: String,
    /// 🚦 Delivery status — starts `sent`, flips to `failed` if the webhook
    /// retries burn out.
    pub status: AlertStatus,
    /// 💬 The terminal send error, when there was one.
    #[serde(default)]
    pub error: Option<String>,
    /// 🕰️ UTC creation timestamp — consistent clock source, so the dashboard
    /// layer can bucket without timezone drift.
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// 📏 Storage cap for sampled logs. `log_count` keeps the real total.
    pub const MAX_STORED_LOGS: usize = 50;
}

/// 📡 An Elasticsearch data source — endpoints, credentials, TLS policy.
///
/// `endpoints` is a `;`-separated list because that is what the config
/// surface has always shipped. The search client splits, trims, and
/// round-robins. Credentials may be stored encrypted at rest; by the time a
/// `DataSource` reaches this crate they are plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub name: String,
    /// 📡 One or more URLs, `;`-separated. `http://es1:9200;http://es2:9200`
    pub endpoints: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 Force TLS even for `http://` URLs. `https://` URLs force it anyway.
    #[serde(default)]
    pub use_ssl: bool,
    /// 🔓 Skip certificate verification. For dev clusters and the brave.
    #[serde(default)]
    pub skip_verify: bool,
    /// 🔒 Custom CA bundle, PEM. When set it becomes the *only* trust root.
    #[serde(default)]
    pub ca_cert: Option<String>,
    pub enabled: bool,
}

/// 🔔 A notification channel — a webhook URL with an on/off switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub name: String,
    pub webhook_url: String,
    pub enabled: bool,
}

/// 🚦 How the last retention sweep went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionStatus {
    #[default]
    Never,
    Success,
    Failed,
}

/// 🗑️ The retention config — a singleton with a split personality.
///
/// The first four fields belong to the user (enable, local-time hour+minute,
/// retention days). The last three belong to the cleanup worker and record
/// how the previous sweep went. Config writes must read-modify-write so the
/// worker's fields survive the edit — the store contract enforces this, and
/// a test stands guard over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// 🕰️ Local-time hour of the daily sweep, 0–23.
    pub hour: u32,
    /// 🕰️ Local-time minute of the daily sweep, 0–59.
    pub minute: u32,
    /// 🗑️ Alerts older than this many days get hard-deleted. Minimum 1.
    pub retention_days: u32,

    // -- 🚦 worker-owned execution status — preserved across config edits
    #[serde(default)]
    pub last_execution_status: RetentionStatus,
    #[serde(default)]
    pub last_execution_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution_result: Option<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        // 🕰️ 03:00 local, 7 days — quiet hours, a week of evidence.
        Self {
            enabled: false,
            hour: 3,
            minute: 0,
            retention_days: 7,
            last_execution_status: RetentionStatus::Never,
            last_execution_time: None,
            last_execution_result: None,
        }
    }
}

/// 🕰️ Renders the `[from, to)` window the way humans read it in the alert
/// record: `"YYYY-MM-DD HH:MM:SS ~ YYYY-MM-DD HH:MM:SS"`, server local time.
/// The dashboard and the card both lean on this exact shape — stable format,
/// do not get creative here.
pub fn format_time_range(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "{} ~ {}",
        from.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        to.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn the_one_where_op_is_a_valid_stage_name_for_operator() {
        // 🧪 Half the world sends `operator`, the other half sends `op`.
        // Both halves deserve love. Or at least deserialization.
        let long: QueryCondition =
            serde_json::from_str(r#"{"field":"level","operator":"=","value":"error"}"#).unwrap();
        let short: QueryCondition =
            serde_json::from_str(r#"{"field":"level","op":"=","value":"error"}"#).unwrap();
        assert_eq!(long.operator, "=");
        assert_eq!(short.operator, "=");
    }

    #[test]
    fn the_one_where_logic_defaults_to_or_like_it_always_has() {
        let cond: QueryCondition =
            serde_json::from_str(r#"{"field":"level","operator":"=","value":"error"}"#).unwrap();
        assert_eq!(cond.logic, Logic::Or);

        let cond: QueryCondition = serde_json::from_str(
            r#"{"field":"level","operator":"=","value":"error","logic":"and"}"#,
        )
        .unwrap();
        assert_eq!(cond.logic, Logic::And);
    }

    #[test]
    fn the_one_where_tiny_intervals_hit_the_ten_second_floor() {
        let rule: Rule = serde_json::from_str(
            r#"{"id":1,"name":"r","index_pattern":"logs-*","interval":3,"enabled":true}"#,
        )
        .unwrap();
        // ⏱️ Asked for 3s, gets 10s. The floor is load-bearing.
        assert_eq!(rule.effective_interval(), Duration::from_secs(10));

        let rule: Rule = serde_json::from_str(
            r#"{"id":1,"name":"r","index_pattern":"logs-*","interval_secs":120,"enabled":true}"#,
        )
        .unwrap();
        assert_eq!(rule.effective_interval(), Duration::from_secs(120));
    }

    #[test]
    fn the_one_where_the_time_range_reads_like_a_receipt() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 11, 55, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let rendered = format_time_range(from, to);
        // 🕰️ Local-time rendering means we can't pin exact digits here, but
        // the shape is non-negotiable: two timestamps, one tilde, one space each side.
        assert!(rendered.contains(" ~ "), "missing the tilde separator: {rendered}");
        let parts: Vec<&str> = rendered.split(" ~ ").collect();
        assert_eq!(parts.len(), 2);
        for part in parts {
            assert_eq!(part.len(), "2024-03-01 11:55:00".len(), "unexpected shape: {part}");
        }
    }

    #[test]
    fn the_one_where_retention_defaults_are_boring_on_purpose() {
        let cfg = RetentionConfig::default();
        assert!(!cfg.enabled);
        assert_eq!((cfg.hour, cfg.minute, cfg.retention_days), (3, 0, 7));
        assert_eq!(cfg.last_execution_status, RetentionStatus::Never);
    }
}
