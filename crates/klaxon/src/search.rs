//! 📡 The search client — where rules go to interrogate Elasticsearch.
//!
//! 🎬 "In a world where log documents hide in shards... one scroll cursor
//! dared to page through all of them." *[record scratch]* 🦆
//!
//! 📜 Contract:
//! - One client per data source, built fresh at each tick. Construction is
//!   cheap; the connection pool underneath does the actual reuse.
//! - `query_logs` runs the initial search with a server-side scroll cursor,
//!   drains pages until empty or the 10,000-doc hard cap, merges `_index`
//!   and `_id` into each `_source`, and ALWAYS clears the cursor server-side
//!   — on success, on failure, on timeout. Scroll contexts are not free and
//!   Elasticsearch remembers who leaks them.
//! - No retries here beyond transparent endpoint rotation on transport
//!   errors. Query retry policy belongs to the next tick; send retry policy
//!   belongs to the notifier. This layer reports and steps aside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::common::{DataSource, Rule};
use crate::errors::ExecError;
use crate::query::build_search_body;

/// 📏 Hard ceiling on documents drained per query. Past this point the
/// sample is already 200× the storage cap — more pages buy nothing but heap.
const MAX_DOCS: usize = 10_000;

/// 🕰️ Server-side scroll keepalive per page fetch.
const SCROLL_KEEPALIVE: &str = "1m";

/// 🔁 Transparent endpoint rotation attempts on transport errors.
const ENDPOINT_ATTEMPTS: usize = 3;

/// 📡 A pooled HTTP client bound to one data source's endpoints and auth.
///
/// 🧠 Knowledge graph: multi-endpoint "round-robin" is a rotating start
/// index over the endpoint list plus up-to-3 transparent attempts when the
/// wire itself fails. HTTP-level rejections (400s, 500s, auth) do NOT
/// rotate — a cluster that answers with an error will answer the same from
/// every address, and hammering siblings just triples the log spam.
pub struct SearchClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    // 🔄 rotating start index for endpoint selection
    rotor: AtomicUsize,
    query_timeout: Duration,
}

// 🔒 password deliberately absent. Debug output ends up in logs, logs end up
// in ticket screenshots, ticket screenshots end up in slide decks.
impl std::fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchClient")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

// ===== wire types =====

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
}

impl SearchClient {
    /// 🚀 Stand up a client for one data source.
    ///
    /// Endpoint string splits on `;`, trims, drops empties, and strips
    /// trailing slashes — one slash of difference, infinite suffering of
    /// difference. TLS policy per source: `https://` or `use_ssl` turns it
    /// on, `skip_verify` disables verification, and a custom CA PEM becomes
    /// the only trust root (the built-in bundle is evicted).
    pub fn from_source(source: &DataSource, query_timeout: Duration) -> Result<Self, ExecError> {
        let endpoints: Vec<String> = source
            .endpoints
            .split(';')
            .map(|ep| ep.trim().trim_end_matches('/').to_string())
            .filter(|ep| !ep.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(ExecError::Config(format!(
                "data source '{}' has no usable endpoints — nothing between the semicolons",
                source.name
            )));
        }

        // 🔧 Pool tuning: generous idle limits, ~90s idle timeout. A scroll
        // drain is a burst of sequential requests — keep the wire warm.
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(query_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32);

        let wants_tls = source.use_ssl || endpoints.iter().any(|ep| ep.starts_with("https://"));
        if wants_tls && source.skip_verify {
            // 🔓 Dev clusters, self-signed certs, and people who like danger.
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &source.ca_cert {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                ExecError::Config(format!(
                    "data source '{}' has an unparseable CA certificate: {e}",
                    source.name
                ))
            })?;
            // 🔒 custom CA in, built-in bundle out — the source said ONLY this root
            builder = builder.tls_certs_only(std::iter::once(cert));
        }

        let http = builder.build().map_err(|e| {
            ExecError::Config(format!(
                "could not assemble an http client for source '{}': {e}",
                source.name
            ))
        })?;

        Ok(Self {
            http,
            endpoints,
            username: source.username.clone(),
            password: source.password.clone(),
            rotor: AtomicUsize::new(0),
            query_timeout,
        })
    }

    /// 📄 Fetch every matching log document in `[from, to)` for this rule.
    ///
    /// Pagination via server-side scroll at `batch_size` docs per page,
    /// capped at [`MAX_DOCS`]. Each returned document is `_source` merged
    /// with `_index` and `_id`. The whole operation is bounded by the query
    /// timeout; a tighter caller deadline (task cancellation) wins because
    /// the caller simply drops this future.
    pub async fn query_logs(
        &self,
        rule: &Rule,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<Value>, ExecError> {
        let mut body = build_search_body(&rule.conditions, from, to)?;
        // page size is transport, not semantics — injected here, not in the builder
        body["size"] = json!(batch_size);

        let deadline = tokio::time::Instant::now() + self.query_timeout;

        // 🏁 Initial page, with endpoint rotation on transport failures.
        let (endpoint, first) = tokio::time::timeout_at(
            deadline,
            self.initial_page(&rule.index_pattern, &body),
        )
        .await
        .map_err(|_| self.timed_out())??;

        let mut scroll_id = first.scroll_id.clone();
        let mut docs: Vec<Value> = Vec::new();

        // 📦 Drain under the remaining budget; whatever happens, the cursor
        // gets cleared afterwards. The drain result waits its turn.
        let drained = tokio::time::timeout_at(
            deadline,
            self.drain_pages(endpoint, first, &mut docs, &mut scroll_id),
        )
        .await;

        if let Some(id) = scroll_id.as_deref() {
            self.clear_scroll(endpoint, id).await;
        }

        match drained {
            Err(_) => Err(self.timed_out()),
            Ok(inner) => {
                inner?;
                debug!("📄 query drained {} docs for rule '{}'", docs.len(), rule.name);
                Ok(docs)
            }
        }
    }

    fn timed_out(&self) -> ExecError {
        ExecError::QueryFailed(format!(
            "query exceeded its {:?} budget — the scroll is slow or the cluster is sulking",
            self.query_timeout
        ))
    }

    /// 🏁 Run the initial search, rotating through endpoints on transport
    /// errors. Returns the endpoint that answered so every subsequent scroll
    /// page goes to the same node — scroll cursors are not portable.
    async fn initial_page<'a>(
        &'a self,
        index_pattern: &str,
        body: &Value,
    ) -> Result<(&'a str, ScrollResponse), ExecError> {
        let start = self.rotor.fetch_add(1, Ordering::Relaxed);
        let mut last_transport = String::new();

        for attempt in 0..ENDPOINT_ATTEMPTS {
            let endpoint = &self.endpoints[(start + attempt) % self.endpoints.len()];
            let url = format!("{endpoint}/{index_pattern}/_search?scroll={SCROLL_KEEPALIVE}");
            match self.authed(self.http.post(&url)).json(body).send().await {
                Ok(resp) => return Ok((endpoint.as_str(), Self::parse_page(resp).await?)),
                Err(e) => {
                    // 📡 wire-level failure — the next address gets a turn
                    warn!("📡 endpoint {endpoint} unreachable (attempt {}): {e}", attempt + 1);
                    last_transport = e.to_string();
                }
            }
        }
        Err(ExecError::QueryFailed(format!(
            "all endpoints refused the initial search: {last_transport}"
        )))
    }

    /// 📦 Page through the scroll until an empty page or the hard cap.
    async fn drain_pages(
        &self,
        endpoint: &str,
        first: ScrollResponse,
        docs: &mut Vec<Value>,
        scroll_id: &mut Option<String>,
    ) -> Result<(), ExecError> {
        let mut page = first;
        loop {
            if page.hits.hits.is_empty() {
                return Ok(());
            }
            for hit in page.hits.hits {
                docs.push(merge_hit(hit));
                if docs.len() >= MAX_DOCS {
                    // 📏 Cap hit. Whatever else matched stays in the cluster.
                    warn!("📏 scroll drain stopped at the {MAX_DOCS}-doc cap");
                    return Ok(());
                }
            }
            let Some(id) = scroll_id.clone() else {
                // cursorless response with a full page — nothing more to fetch
                return Ok(());
            };
            page = self.next_page(endpoint, &id).await?;
            if let Some(new_id) = &page.scroll_id {
                *scroll_id = Some(new_id.clone());
            }
        }
    }

    async fn next_page(&self, endpoint: &str, scroll_id: &str) -> Result<ScrollResponse, ExecError> {
        let url = format!("{endpoint}/_search/scroll");
        let resp = self
            .authed(self.http.post(&url))
            .json(&json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id }))
            .send()
            .await
            .map_err(|e| ExecError::QueryFailed(format!("scroll page fetch failed: {e}")))?;
        Self::parse_page(resp).await
    }

    /// 🗑️ Best-effort server-side cursor cleanup. Failure here is logged and
    /// forgotten — the keepalive expires it anyway, we just prefer not to
    /// squat on cluster memory for a minute longer than needed.
    async fn clear_scroll(&self, endpoint: &str, scroll_id: &str) {
        let url = format!("{endpoint}/_search/scroll");
        let result = self
            .authed(self.http.delete(&url))
            .json(&json!({ "scroll_id": [scroll_id] }))
            .send()
            .await;
        if let Err(e) = result {
            debug!("🗑️ scroll clear failed (cursor will age out on its own): {e}");
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_ref()),
            None => req,
        }
    }

    /// 🚦 Status triage: auth rejections and non-2xx become `QueryFailed`
    /// with enough upstream detail to file a reasonable postmortem.
    async fn parse_page(resp: reqwest::Response) -> Result<ScrollResponse, ExecError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ExecError::QueryFailed(format!(
                "authentication rejected ({status}) — check the data source credentials"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExecError::QueryFailed(format!(
                "elasticsearch answered {status}: {body}"
            )));
        }
        resp.json::<ScrollResponse>().await.map_err(|e| {
            ExecError::QueryFailed(format!("unparseable search response: {e}"))
        })
    }
}

/// 🔗 `_source` + `_index` + `_id` → one flat document. The downstream card
/// formatter and the stored sample both want to know where a log came from.
fn merge_hit(hit: RawHit) -> Value {
    let mut doc = hit.source;
    doc.insert("_index".into(), Value::String(hit.index));
    doc.insert("_id".into(), Value::String(hit.id));
    Value::Object(doc)
}
