//! 💀 The error taxonomy — every way a tick can go wrong, with a name tag.
//!
//! 🧠 Knowledge graph: the engine speaks two dialects of error.
//! - `ExecError` (this module, thiserror): the *kinds* that drive policy.
//!   The scheduler and evaluator match on these to decide whether to advance
//!   the window cursor, whether to flip an alert to `failed`, whether to
//!   just log and move on.
//! - `anyhow` (everywhere at the app boundary): context-rich, human-facing,
//!   for the CLI and the store seams where kinds don't change behavior.
//!
//! Policy cheat sheet, because 3am-you will not remember:
//!
//! | kind          | window advanced? | alert_count? | process dies? |
//! |---------------|------------------|--------------|---------------|
//! | `Config`      | no               | no           | no            |
//! | `QueryFailed` | no               | no           | no            |
//! | `PersistFailed` | yes            | no           | no            |
//! | `SendFailed`  | yes              | no           | no            |
//! | `SendTimeout` | yes              | no           | no            |
//! | `CleanupFailed` | n/a            | n/a          | no            |
//! | `Cancelled`   | depends on where | no           | no            |
//!
//! Nothing here is fatal. The only way this process dies on purpose is
//! startup-time config validation, and that happens in `app_config`.

use std::time::Duration;

/// 💀 One tick's worth of possible disappointment.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// 🔧 Missing/disabled/inconsistent rule config — no webhook anywhere,
    /// a data-source reference pointing at a disabled source, etc.
    /// Skip the tick, log, leave `last_run_time` alone.
    #[error("rule config error: {0}")]
    Config(String),

    /// 📡 Elasticsearch said no — transport error, auth rejection, non-2xx.
    /// Skip the tick, don't advance the cursor, the next tick retries the window.
    #[error("elasticsearch query failed: {0}")]
    QueryFailed(String),

    /// 🗃️ The alert write failed. Log it, still attempt the notification,
    /// never increment `alert_count` (there's no record to count).
    #[error("alert persistence failed: {0}")]
    PersistFailed(String),

    /// 🔔 Webhook retries exhausted, non-2xx, or a non-zero ack `code`.
    /// The alert flips to `failed` with this message. No further retry.
    #[error("webhook send failed: {0}")]
    SendFailed(String),

    /// ⏳ The overall send budget ran out mid-retry. Treated as `SendFailed`.
    #[error("webhook send budget of {0:?} exhausted")]
    SendTimeout(Duration),

    /// 🗑️ The retention sweep blew up. Status goes to `failed`, the worker
    /// keeps breathing and tries again tomorrow.
    #[error("retention cleanup failed: {0}")]
    CleanupFailed(String),

    /// 🛑 Shutdown (or a rule-disable) observed mid-wait. Exit quietly,
    /// no side effects past whatever already committed.
    #[error("cancelled")]
    Cancelled,
}

impl ExecError {
    /// 🚦 Should this tick's failure freeze the window cursor?
    /// Query and config failures retry the same window next tick — anything
    /// after the cursor commit does not get to rewind it.
    pub fn freezes_cursor(&self) -> bool {
        matches!(self, ExecError::Config(_) | ExecError::QueryFailed(_) | ExecError::Cancelled)
    }
}
