//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where rules tick endlessly..."
//! 🎬 "One scheduler dared to reconcile them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Scheduler module — part air-traffic controller, part helicopter
//! parent, part that one project manager who checks in every thirty seconds
//! *and* the moment anyone pings them.
//!
//! 🧠 Knowledge graph, because this is the most concurrent file in the crate:
//! - **Reconcile task** (one): ticks every `WORKER_CHECK_INTERVAL` and wakes
//!   on the trigger channel. Sole writer of the running-rules map. Compares
//!   "enabled in store" against "running here": cancels the stale, starts
//!   the new.
//! - **Per-rule tasks** (N): one per enabled rule, each owning a child
//!   cancellation token. Serial per rule BY CONSTRUCTION — there is no lock
//!   enforcing at-most-one-evaluation-per-rule, there is simply exactly one
//!   task that could ever run one.
//! - **Trigger channel**: bounded, many producers (API handlers, via
//!   [`SchedulerHandle`]), one consumer (reconcile). `try_send` only — a
//!   full buffer DROPS the trigger, and that is fine: it's a latency hint,
//!   not a correctness mechanism. The next periodic reconcile catches up.
//! - **Semaphore**: `WORKER_MAX_CONCURRENCY` slots gate every execution AND
//!   its detached notification. Acquisition waits; cancellation while
//!   waiting exits without running.
//!
//! ⚠️ DO NOT MAKE rule_task PUB EVER
//! ⚠️ YOU HAVE BEEN WARNED
//! 💀 RULE TASKS ARE THE SCHEDULER'S PRIVATE LITTLE MINIONS WHOM THE WORLD FORGOT ABOUT
//! 🔒 Like Fight Club, but for cooperative cancellation. First rule: you
//! don't spawn the rule tasks yourself.

mod rule_task;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_config::WorkerSettings;
use crate::evaluator::Evaluator;
use crate::stores::Stores;

/// 📬 Trigger buffer size. ~100 pending hints before we start dropping them
/// on the floor and letting the periodic reconcile sweep up.
const TRIGGER_BUFFER: usize = 100;

/// 🎫 The capability object handed to the outside world (read: the HTTP
/// layer). It can poke the scheduler about a rule and NOTHING else — no
/// stopping, no starting, no map access. Handlers depend on this, not on
/// the scheduler itself, which is the whole point.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    trigger_tx: async_channel::Sender<i64>,
}

impl SchedulerHandle {
    /// 📬 Non-blocking nudge: "rule N changed, look at it soon please."
    /// A full buffer drops the nudge — the periodic reconcile is the net.
    pub fn trigger_rule(&self, rule_id: i64) {
        if self.trigger_tx.try_send(rule_id).is_err() {
            debug!("📬 trigger buffer full — rule {rule_id} hint dropped, periodic reconcile will catch it");
        }
    }
}

/// 🧵 One running per-rule task: its private cancel token and its handle.
struct RuleTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 🗓️ The scheduler: owns the reconcile loop, the per-rule task fleet, the
/// global semaphore, and the shutdown drain.
pub struct Scheduler {
    evaluator: Arc<Evaluator>,
    stores: Stores,
    settings: WorkerSettings,
    semaphore: Arc<Semaphore>,
    root: CancellationToken,
    running: Arc<Mutex<HashMap<i64, RuleTask>>>,
    trigger_tx: async_channel::Sender<i64>,
    trigger_rx: async_channel::Receiver<i64>,
    reconcile: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(evaluator: Evaluator, stores: Stores, settings: WorkerSettings) -> Self {
        let (trigger_tx, trigger_rx) = async_channel::bounded(TRIGGER_BUFFER);
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrency));
        Self {
            evaluator: Arc::new(evaluator),
            stores,
            settings,
            semaphore,
            root: CancellationToken::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            trigger_tx,
            trigger_rx,
            reconcile: None,
        }
    }

    /// 🎫 Mint a trigger capability for the outer layers. Clone freely.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            trigger_tx: self.trigger_tx.clone(),
        }
    }

    /// 🚀 Spawn the reconcile loop. The first reconcile happens immediately,
    /// so enabled rules start ticking the moment the scheduler does.
    pub fn start(&mut self) {
        if self.reconcile.is_some() {
            warn!("🗓️ scheduler start() called twice — ignoring the encore");
            return;
        }
        info!(
            "🗓️ scheduler starting — reconcile every {:?}, {} concurrency slots",
            self.settings.check_interval, self.settings.max_concurrency
        );
        let reconciler = Reconciler {
            evaluator: self.evaluator.clone(),
            stores: self.stores.clone(),
            semaphore: self.semaphore.clone(),
            root: self.root.clone(),
            running: self.running.clone(),
            trigger_rx: self.trigger_rx.clone(),
            check_interval: self.settings.check_interval,
        };
        self.reconcile = Some(tokio::spawn(reconciler.run()));
    }

    /// 🛑 Graceful shutdown: cancel everything, then wait (bounded) for the
    /// fleet to land — including detached notification tasks, which still
    /// hold semaphore permits. Draining the semaphore IS waiting for them.
    pub async fn stop(&mut self) {
        info!("🛑 scheduler stopping — draining in-flight evaluations");
        self.root.cancel();

        if let Some(handle) = self.reconcile.take() {
            let _ = handle.await;
        }

        let tasks: Vec<RuleTask> = {
            let mut running = self.running.lock().await;
            running.drain().map(|(_, task)| task).collect()
        };

        let max_concurrency = self.settings.max_concurrency as u32;
        let semaphore = self.semaphore.clone();
        let drain = async move {
            for task in tasks {
                let _ = task.handle.await;
            }
            // every permit home = every evaluation and detached send settled
            let _ = semaphore.acquire_many(max_concurrency).await;
        };

        if tokio::time::timeout(self.settings.drain_timeout, drain).await.is_err() {
            warn!(
                "⏳ drain exceeded {:?} — abandoning the stragglers to the runtime",
                self.settings.drain_timeout
            );
        }
        info!("🛑 scheduler stopped");
    }
}

// ============================================================
// 🔄 Reconciler — the one true writer of the running map
// ============================================================

struct Reconciler {
    evaluator: Arc<Evaluator>,
    stores: Stores,
    semaphore: Arc<Semaphore>,
    root: CancellationToken,
    running: Arc<Mutex<HashMap<i64, RuleTask>>>,
    trigger_rx: async_channel::Receiver<i64>,
    check_interval: std::time::Duration,
}

impl Reconciler {
    async fn run(self) {
        // first tick fires immediately — enabled rules don't wait 30s to exist
        let mut tick = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile().await,
                trigger = self.trigger_rx.recv() => match trigger {
                    Ok(rule_id) => self.handle_trigger(rule_id).await,
                    Err(_) => break,
                },
                _ = self.root.cancelled() => break,
            }
        }
        debug!("🔄 reconcile loop exiting");
    }

    /// 🔄 Diff "enabled in store" against "running here" and fix the drift.
    async fn reconcile(&self) {
        let enabled = match self.stores.rules.get_enabled_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("🔄 reconcile skipped — enabled-rule load failed: {e}");
                return;
            }
        };
        let enabled_set: HashSet<i64> = enabled.iter().copied().collect();

        let mut running = self.running.lock().await;

        // 🛑 running but no longer enabled → cancel and forget
        let stale: Vec<i64> = running
            .keys()
            .filter(|id| !enabled_set.contains(id))
            .copied()
            .collect();
        for rule_id in stale {
            if let Some(task) = running.remove(&rule_id) {
                task.cancel.cancel();
                info!("🛑 rule {rule_id} no longer enabled — task cancelled");
            }
        }

        // 🚀 enabled but not running → spawn a per-rule task
        for rule_id in enabled {
            if !running.contains_key(&rule_id) {
                let cancel = self.root.child_token();
                let handle = tokio::spawn(rule_task::run(
                    rule_id,
                    self.evaluator.clone(),
                    self.stores.clone(),
                    self.semaphore.clone(),
                    cancel.clone(),
                ));
                running.insert(rule_id, RuleTask { cancel, handle });
                info!("🚀 rule {rule_id} enabled — task started");
            }
        }
    }

    /// 📬 A trigger arrived: reconcile right now, and if the rule is enabled
    /// but somehow *still* not running (a disabled-then-enabled edit racing
    /// the store), run it once directly, forced, under the semaphore.
    async fn handle_trigger(&self, rule_id: i64) {
        debug!("📬 trigger received for rule {rule_id}");
        self.reconcile().await;

        let already_running = self.running.lock().await.contains_key(&rule_id);
        if already_running {
            return;
        }
        match self.stores.rules.get(rule_id).await {
            Ok(Some(rule)) if rule.enabled => {
                rule_task::execute_under_slot(
                    &self.evaluator,
                    &self.semaphore,
                    &self.root,
                    &rule,
                    true,
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => warn!("📬 trigger for rule {rule_id}: load failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DataSource, Rule};
    use crate::notify::Notifier;
    use crate::stores::InMemoryStore;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn test_rule(id: i64, webhook: &str, enabled: bool) -> Rule {
        Rule {
            id,
            name: format!("rule-{id}"),
            index_pattern: "app-*".into(),
            conditions: vec![],
            interval_secs: 60,
            data_source_id: None,
            channel_id: None,
            webhook_url: Some(webhook.into()),
            enabled,
            description: String::new(),
            last_run_time: None,
            run_count: 0,
            alert_count: 0,
        }
    }

    fn settings(es_uri: &str, check_interval: Duration, max_concurrency: usize) -> WorkerSettings {
        WorkerSettings {
            check_interval,
            max_concurrency,
            retry_times: 5,
            batch_size: 100,
            send_timeout: Duration::from_secs(20),
            es_query_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            default_source: Some(DataSource {
                id: 0,
                name: "default".into(),
                endpoints: es_uri.into(),
                username: None,
                password: None,
                use_ssl: false,
                skip_verify: false,
                ca_cert: None,
                enabled: true,
            }),
            ..WorkerSettings::default()
        }
    }

    fn build_scheduler(
        stores: &Stores,
        settings: WorkerSettings,
    ) -> Scheduler {
        let notifier = Notifier::new(settings.retry_times).unwrap();
        let evaluator = Evaluator::new(stores.clone(), notifier, settings.clone());
        Scheduler::new(evaluator, stores.clone(), settings)
    }

    async fn mount_empty_es(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/app-*/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "c", "hits": { "hits": [] }
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    async fn wait_for_run_count(store: &InMemoryStore, rule_id: i64, n: u64) {
        for _ in 0..200 {
            if store.rule(rule_id).await.map(|r| r.run_count) >= Some(n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("💀 rule {rule_id} never reached run_count {n}");
    }

    #[tokio::test]
    async fn the_one_where_enabling_a_rule_summons_a_task() {
        let es = MockServer::start().await;
        mount_empty_es(&es).await;

        let (stores, store) = Stores::in_memory();
        store.put_rule(test_rule(1, "http://example.invalid/hook", true)).await;
        store.put_rule(test_rule(2, "http://example.invalid/hook", false)).await;

        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_millis(100), 4));
        scheduler.start();

        // rule 1 force-executes on task start; rule 2 stays dormant
        wait_for_run_count(&store, 1, 1).await;
        assert_eq!(store.rule(2).await.unwrap().run_count, 0);
        assert_eq!(scheduler.running.lock().await.len(), 1);

        // ✏️ flip rule 2 on — next reconcile pass picks it up
        store.put_rule(test_rule(2, "http://example.invalid/hook", true)).await;
        wait_for_run_count(&store, 2, 1).await;
        assert_eq!(scheduler.running.lock().await.len(), 2);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_disabling_a_rule_recalls_its_task() {
        let es = MockServer::start().await;
        mount_empty_es(&es).await;

        let (stores, store) = Stores::in_memory();
        store.put_rule(test_rule(1, "http://example.invalid/hook", true)).await;

        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_millis(100), 4));
        scheduler.start();
        wait_for_run_count(&store, 1, 1).await;

        // ✏️ disable — reconcile should cancel the task and shrink the map
        let mut rule = store.rule(1).await.unwrap();
        rule.enabled = false;
        store.put_rule(rule).await;

        for _ in 0..100 {
            if scheduler.running.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(scheduler.running.lock().await.is_empty(), "task should be recalled");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_the_trigger_skips_the_queue() {
        let es = MockServer::start().await;
        mount_empty_es(&es).await;

        let (stores, store) = Stores::in_memory();
        // ⏱️ check interval of a full minute — only the trigger can explain
        // anything happening within the next few hundred milliseconds
        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_secs(60), 4));
        scheduler.start();
        // let the initial (empty) reconcile pass
        tokio::time::sleep(Duration::from_millis(100)).await;

        store.put_rule(test_rule(7, "http://example.invalid/hook", true)).await;
        scheduler.handle().trigger_rule(7);

        wait_for_run_count(&store, 7, 1).await;
        scheduler.stop().await;
    }

    // 📊 Records when each search request lands, so the test can reconstruct
    // how many evaluations were in flight at once.
    struct TrackingResponder {
        starts: Arc<StdMutex<Vec<Instant>>>,
        delay: Duration,
    }

    impl Respond for TrackingResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.starts.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
                .set_body_json(json!({ "_scroll_id": "c", "hits": { "hits": [] } }))
                .set_delay(self.delay)
        }
    }

    #[tokio::test]
    async fn the_one_where_five_rules_share_two_lanes_without_crashing() {
        // 🧪 Scenario: WORKER_MAX_CONCURRENCY=2, five rules due at once.
        // All five complete, each exactly once, never more than two in flight.
        let es = MockServer::start().await;
        let starts = Arc::new(StdMutex::new(Vec::new()));
        let delay = Duration::from_millis(300);
        Mock::given(method("POST"))
            .and(path("/app-*/_search"))
            .respond_with(TrackingResponder {
                starts: starts.clone(),
                delay,
            })
            .mount(&es)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&es)
            .await;

        let (stores, store) = Stores::in_memory();
        for id in 1..=5 {
            store.put_rule(test_rule(id, "http://example.invalid/hook", true)).await;
        }

        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_millis(100), 2));
        scheduler.start();

        for id in 1..=5 {
            wait_for_run_count(&store, id, 1).await;
        }
        scheduler.stop().await;

        // each rule evaluated exactly once — no double ticks, no drops
        for id in 1..=5 {
            assert_eq!(store.rule(id).await.unwrap().run_count, 1, "rule {id}");
        }

        // 🧮 sweep-line over [start, start+delay) intervals: the request is
        // in flight (and its permit held) at least that long, so overlap
        // counted this way can only UNDERcount — never falsely exceed.
        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 5);
        let mut events: Vec<(Instant, i32)> = Vec::new();
        for &s in starts.iter() {
            events.push((s, 1));
            events.push((s + delay, -1));
        }
        events.sort_by_key(|&(t, delta)| (t, delta));
        let (mut in_flight, mut peak) = (0i32, 0i32);
        for (_, delta) in events {
            in_flight += delta;
            peak = peak.max(in_flight);
        }
        assert!(peak <= 2, "observed {peak} concurrent evaluations with 2 slots");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn the_one_where_a_mid_retry_disable_cuts_the_line() {
        // 🧪 Scenario: alert persisted, webhook 500ing, retries sleeping —
        // the rule gets disabled. The retry nap must end early, the alert
        // must survive (as failed), and the cursor must already be advanced.
        let es = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app-*/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "c",
                "hits": { "hits": [
                    { "_index": "app-2024.03.01", "_id": "x", "_source": { "message": "boom" } }
                ] }
            })))
            .up_to_n_times(1)
            .mount(&es)
            .await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "c", "hits": { "hits": [] }
            })))
            .mount(&es)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&es)
            .await;

        let hook = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&hook)
            .await;

        let (stores, store) = Stores::in_memory();
        store.put_rule(test_rule(1, &format!("{}/hook", hook.uri()), true)).await;

        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_millis(100), 4));
        scheduler.start();

        // wait for the alert record — the send is now inside its retry ladder
        let alert_id = loop {
            let alerts = store.alerts_for_rule(1).await;
            if let Some(alert) = alerts.first() {
                break alert.id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        // ✏️ disable mid-retry
        let mut rule = store.rule(1).await.unwrap();
        rule.enabled = false;
        store.put_rule(rule).await;

        // 🛑 cancellation should surface as a failed alert well before the
        // full 5-attempt ladder (~15s of sleeps) could ever finish
        let started = Instant::now();
        loop {
            let alerts = store.alerts_for_rule(1).await;
            if alerts[0].status == crate::common::AlertStatus::Failed {
                break;
            }
            assert!(
                started.elapsed() < Duration::from_secs(8),
                "cancellation never reached the retry sleep"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let alerts = store.alerts_for_rule(1).await;
        assert_eq!(alerts[0].id, alert_id, "the persisted alert must survive");
        assert!(alerts[0].error.as_deref().unwrap_or_default().contains("cancelled"));
        assert!(store.rule(1).await.unwrap().last_run_time.is_some());
        assert_eq!(store.rule(1).await.unwrap().alert_count, 0);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_stop_waits_for_the_fleet_to_land() {
        let es = MockServer::start().await;
        mount_empty_es(&es).await;

        let (stores, store) = Stores::in_memory();
        store.put_rule(test_rule(1, "http://example.invalid/hook", true)).await;

        let mut scheduler =
            build_scheduler(&stores, settings(&es.uri(), Duration::from_millis(100), 2));
        scheduler.start();
        wait_for_run_count(&store, 1, 1).await;

        scheduler.stop().await;

        // after stop: no further executions, however long we stare
        let frozen = store.rule(1).await.unwrap().run_count;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.rule(1).await.unwrap().run_count, frozen);
    }
}
