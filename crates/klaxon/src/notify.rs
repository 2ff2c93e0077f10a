//! 🔔 The notifier — where alerts become webhook POSTs, with feelings.
//!
//! 🎬 *[a card is formatted. a POST is fired. a 500 comes back.]*
//! *[the notifier breathes. counts to one-ish seconds. tries again.]*
//! *[somewhere, a budget timer is watching. it is not impressed.]*
//!
//! 📜 Contract:
//! - At most `max_attempts` POSTs per alert. The delay before attempt *k*
//!   (k≥2) is `min(2^(k-2), 8)` seconds plus up to 250ms of uniform jitter —
//!   1s, 2s, 4s, 8s, 8s... The jitter is anti-thundering-herd insurance for
//!   the day fifty rules all fail against the same dead webhook.
//! - Success is HTTP 200 **and** an ack body with `code == 0`. A 200 with
//!   `code: 19001` is the webhook saying "delivered to /dev/null" — that is
//!   a failure, whatever the status line claims.
//! - The caller wraps the whole send in the budget timeout; we just make
//!   sure every sleep is cancellation-aware so a disabled rule or a
//!   shutdown doesn't leave us snoring through a retry ladder.
//! - Never panics. The webhook can be down, slow, drunk, or lying — the
//!   worst we do is return `SendFailed` with the receipts.

pub(crate) mod card;

use std::time::Duration;

use rand::Rng as _;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Rule;
use crate::errors::ExecError;

/// ⏳ Per-attempt HTTP timeout. The *overall* budget lives with the caller.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// 📈 Backoff ceiling — delays stop doubling at 8 seconds.
const BACKOFF_CAP_SECS: u64 = 8;

/// 🎲 Uniform jitter added to every backoff sleep, in milliseconds.
const JITTER_MS: u64 = 250;

/// 🔔 The webhook dispatcher. One per process, cheap to share — the retry
/// count is config, the HTTP client is pooled, the state is nothing.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    max_attempts: u32,
}

/// 📩 What a webhook endpoint says back. `code == 0` is the only yes.
#[derive(Debug, Deserialize)]
struct WebhookAck {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
}

impl Notifier {
    pub fn new(max_attempts: u32) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("💀 Couldn't build the webhook HTTP client: {e}. No client, nobody gets paged."))?;
        Ok(Self {
            http,
            max_attempts: max_attempts.max(1),
        })
    }

    /// 🔔 Format and deliver one alert: card from the first 3 of up to 10
    /// transmitted samples, then the retry ladder against the webhook.
    pub async fn send_alert(
        &self,
        cancel: &CancellationToken,
        webhook_url: &str,
        rule: &Rule,
        samples: &[Value],
        original_count: u64,
        time_range: &str,
    ) -> Result<(), ExecError> {
        let payload = card::format_card(rule, samples, original_count, time_range);
        self.send(cancel, webhook_url, &payload).await
    }

    /// 📡 The retry ladder. Delivers `payload` or explains why it couldn't.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        webhook_url: &str,
        payload: &Value,
    ) -> Result<(), ExecError> {
        let mut last_failure = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = backoff_delay(attempt);
                debug!("🔁 webhook attempt {attempt} in {delay:?}");
                // 🛑 the sleep is a suspension point — shutdown and
                // rule-disable both land here, and we leave without a fuss
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                }
            }

            match self.post_once(webhook_url, payload).await {
                Ok(()) => {
                    debug!("✅ webhook accepted the card on attempt {attempt}");
                    return Ok(());
                }
                Err(reason) => {
                    warn!("🔔 webhook attempt {attempt}/{} failed: {reason}", self.max_attempts);
                    last_failure = reason;
                }
            }
        }

        Err(ExecError::SendFailed(format!(
            "{} attempts exhausted, last failure: {last_failure}",
            self.max_attempts
        )))
    }

    /// 📡 One POST, one verdict. Success needs a 200 AND `code == 0` in the
    /// ack — either one alone is just the webhook being polite.
    async fn post_once(&self, url: &str, payload: &Value) -> Result<(), String> {
        let resp = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| format!("transport: {e}"))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(format!("webhook answered {status}"));
        }
        let ack: WebhookAck = resp
            .json()
            .await
            .map_err(|e| format!("200 but the ack body was unreadable: {e}"))?;
        if ack.code != 0 {
            return Err(format!(
                "webhook ack code {} ({})",
                ack.code,
                ack.msg.unwrap_or_default()
            ));
        }
        Ok(())
    }
}

/// 📈 Delay before attempt `k` (k ≥ 2): `min(2^(k-2), 8)`s + jitter.
/// The shift is clamped so attempt 60 doesn't ask for 2^58 seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2).min(3);
    let base_secs = (1u64 << exponent).min(BACKOFF_CAP_SECS);
    let jitter_ms = rand::rng().random_range(0..=JITTER_MS);
    Duration::from_secs(base_secs) + Duration::from_millis(jitter_ms)
}
