//! 🔧 App Configuration — thirteen env vars and the struct they deserve.
//!
//! 📡 This service deploys as a container with a wall of `WORKER_*` env vars
//! and, on dev laptops, a TOML override file. Both paths land in the same
//! [`AppConfig`] so the engine never has to know which one fed it. 🦆
//!
//! 🏗️ Figment does the layering; serde does the defaults. The alternative is
//! thirteen hand-rolled `std::env::var` calls with thirteen slightly
//! different parse-and-default dances, and nobody audits those at 3am.
//!
//! 🧠 Knowledge graph: the env surface is FLAT and UPPERCASE
//! (`WORKER_MAX_CONCURRENCY=4`), figment lowercases it, serde fills the
//! gaps with defaults. An optional TOML file merges on top for local dev.
//! `validate()` is the startup gate — the only place in this crate where an
//! error is allowed to kill the process.

use anyhow::Context;
use base64::Engine as _;
use serde::Deserialize;
// -- 🔧 Figment merges env + optional TOML into one coherent view, which is
// -- exactly the two-source story this config has. One extractor, zero drift.
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use std::path::Path;
use std::time::Duration;
// -- 🚀 tracing::info — because println! in production is a cry for help.
use tracing::{info, warn};

use crate::common::DataSource;

// ============================================================
// 🔧 AppConfig — the knobs we admit in public
// ============================================================

/// ⚙️ The recognized configuration surface, one field per documented option.
///
/// 🎯 Defaults are conservative enough to not immediately explode on first
/// run, ambitious enough to evaluate actual rules: 30s reconcile, 10-wide
/// semaphore, 3 webhook attempts, 200-doc ES pages. 🦆
///
/// The `ES_*` quartet describes the process-wide default data source — the
/// fallback for rules that don't link a source of their own. `ES_URL` being
/// empty is a startup-fatal condition, because a fleet of rules with nowhere
/// to query is just a very elaborate no-op.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 🔌 `WORKER_ENABLED` — master switch for the scheduler.
    #[serde(default = "default_true")]
    pub worker_enabled: bool,
    /// ⏱️ `WORKER_CHECK_INTERVAL` — reconcile cadence, seconds.
    #[serde(default = "default_check_interval")]
    pub worker_check_interval: u64,
    /// 🧵 `WORKER_MAX_CONCURRENCY` — semaphore capacity. Floor-clamped to 1.
    #[serde(default = "default_max_concurrency")]
    pub worker_max_concurrency: usize,
    /// 🔁 `WORKER_RETRY_TIMES` — webhook attempts per alert.
    #[serde(default = "default_retry_times")]
    pub worker_retry_times: u32,
    /// 📄 `WORKER_BATCH_SIZE` — ES page size per scroll request.
    #[serde(default = "default_batch_size")]
    pub worker_batch_size: usize,
    /// ⏳ `ALERT_SEND_TIMEOUT_SECONDS` — total webhook budget per alert.
    #[serde(default = "default_send_timeout")]
    pub alert_send_timeout_seconds: u64,
    /// ⏳ `ES_QUERY_TIMEOUT_SECONDS` — ceiling on one whole query+scroll drain.
    #[serde(default = "default_es_timeout")]
    pub es_query_timeout_seconds: u64,
    /// ⏳ `DB_QUERY_TIMEOUT_SECONDS` — budget store implementations apply to
    /// their queries. The in-memory store has nothing slow to bound.
    #[serde(default = "default_db_timeout")]
    pub db_query_timeout_seconds: u64,
    /// 🔐 `APP_ENCRYPTION_KEY` — base64 of exactly 32 bytes, optional.
    /// Secrets-at-rest live outside this crate; we validate the key at
    /// startup so a truncated paste dies loudly instead of at first decrypt.
    #[serde(default)]
    pub app_encryption_key: Option<String>,

    // -- 📡 the process-wide default data source (ES_URL and friends)
    /// 📡 `ES_URL` — default endpoints, `;`-separated. Empty = startup error.
    #[serde(default)]
    pub es_url: String,
    #[serde(default)]
    pub es_username: Option<String>,
    #[serde(default)]
    pub es_password: Option<String>,
    #[serde(default)]
    pub es_skip_verify: bool,
}

fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    10
}
fn default_retry_times() -> u32 {
    3
}
fn default_batch_size() -> usize {
    200
}
fn default_send_timeout() -> u64 {
    20
}
fn default_es_timeout() -> u64 {
    30
}
fn default_db_timeout() -> u64 {
    5
}

/// 🔑 The env keys we admit to recognizing. Everything else in the process
/// environment (PATH, HOME, that one zsh variable) stays in the lobby.
const RECOGNIZED_KEYS: [&str; 13] = [
    "worker_enabled",
    "worker_check_interval",
    "worker_max_concurrency",
    "worker_retry_times",
    "worker_batch_size",
    "alert_send_timeout_seconds",
    "es_query_timeout_seconds",
    "db_query_timeout_seconds",
    "app_encryption_key",
    "es_url",
    "es_username",
    "es_password",
    "es_skip_verify",
];

impl AppConfig {
    /// 🚪 Startup-time validation — the ONLY place a config problem is fatal.
    ///
    /// Fails on: empty `ES_URL` (no default source means rules without a
    /// linked source can never run), and a present-but-wrong
    /// `APP_ENCRYPTION_KEY` (must decode to exactly 32 bytes of AES-256
    /// material). Everything else is clamped or defaulted.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.es_url.trim().is_empty() {
            anyhow::bail!(
                "💀 ES_URL is empty. A log alerting service with no default \
                 Elasticsearch to query is performance art, not software. Set ES_URL."
            );
        }
        if let Some(key) = &self.app_encryption_key {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key.trim())
                .context("💀 APP_ENCRYPTION_KEY is not valid base64. Paste the whole key, not most of it.")?;
            if decoded.len() != 32 {
                anyhow::bail!(
                    "💀 APP_ENCRYPTION_KEY decodes to {} bytes, needs exactly 32. \
                     AES-256 is picky like that.",
                    decoded.len()
                );
            }
        }
        Ok(())
    }

    /// 🧵 Semaphore capacity with the floor applied. Zero-wide semaphores
    /// deadlock everything forever, so 0 quietly becomes 1 (with a warning).
    pub fn max_concurrency(&self) -> usize {
        if self.worker_max_concurrency < 1 {
            warn!("⚠️ WORKER_MAX_CONCURRENCY={} clamped to 1", self.worker_max_concurrency);
            1
        } else {
            self.worker_max_concurrency
        }
    }

    /// 📡 The process-wide default data source, built from the `ES_*` knobs.
    /// `None` only when `ES_URL` is empty — which `validate()` already fails.
    pub fn default_data_source(&self) -> Option<DataSource> {
        if self.es_url.trim().is_empty() {
            return None;
        }
        Some(DataSource {
            id: 0,
            name: "default".into(),
            endpoints: self.es_url.clone(),
            username: self.es_username.clone(),
            password: self.es_password.clone(),
            use_ssl: false,
            skip_verify: self.es_skip_verify,
            ca_cert: None,
            enabled: true,
        })
    }
}

// ============================================================
// ⚙️ WorkerSettings — AppConfig, pre-chewed for the engine
// ============================================================

/// ⚙️ The engine-facing view of the config: seconds become `Duration`s,
/// clamps are applied, the default source is materialized. The scheduler,
/// evaluator, and notifier all take this instead of raw `AppConfig` — tests
/// build it directly with tiny timeouts and nobody has to fake env vars.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub check_interval: Duration,
    pub max_concurrency: usize,
    pub retry_times: u32,
    pub batch_size: usize,
    pub send_timeout: Duration,
    pub es_query_timeout: Duration,
    pub drain_timeout: Duration,
    pub default_source: Option<DataSource>,
}

impl From<&AppConfig> for WorkerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            enabled: cfg.worker_enabled,
            check_interval: Duration::from_secs(cfg.worker_check_interval.max(1)),
            max_concurrency: cfg.max_concurrency(),
            retry_times: cfg.worker_retry_times.max(1),
            batch_size: cfg.worker_batch_size.max(1),
            send_timeout: Duration::from_secs(cfg.alert_send_timeout_seconds.max(1)),
            es_query_timeout: Duration::from_secs(cfg.es_query_timeout_seconds.max(1)),
            // 🛑 fixed shutdown drain — long enough to finish a webhook retry
            // ladder, short enough that ops doesn't reach for SIGKILL
            drain_timeout: Duration::from_secs(30),
            default_source: cfg.default_data_source(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            max_concurrency: 10,
            retry_times: 3,
            batch_size: 200,
            send_timeout: Duration::from_secs(20),
            es_query_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            default_source: None,
        }
    }
}

/// 🚀 Load the config — from env vars, an optional TOML file, or the sheer
/// power of serde defaults.
///
/// 🔧 Env is the base layer (only the recognized keys — we don't gatekeep
/// values, but we do gatekeep keys), TOML merges on top. TOML wins on
/// conflicts, which is exactly what you want for a local override file.
///
/// 💀 Returns an error if config is unparseable. Which it will be. Check the
/// error message though — it's contextual, informative, and written with
/// love. Or despair. Hard to tell at 3am.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new("<env only>"))
    );

    // -- 🏗️ Env base layer — flat uppercase vars, lowercased by figment.
    let config = Figment::new().merge(Env::raw().only(&RECOGNIZED_KEYS));

    // -- 🎯 Layer in TOML only if a file was actually provided. No file is the
    // -- normal production case — containers speak env var and nothing else.
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables. \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables. \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
