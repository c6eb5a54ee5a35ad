//! Health supervision of registered nodes.
//!
//! A single scheduler task owns the working set of active nodes. It loads
//! the set at startup, receives newly created nodes through a channel, and
//! on every tick fans out HTTP probes bounded by a semaphore. A node that
//! answers `/health` with 200 has its failure counter reset; any other
//! outcome increments it, and a node that reaches the failure threshold is
//! persisted as inactive and pruned from the set.
//!
//! The working set is never shared: every read and write happens on the
//! scheduler task, so there is no lock around it. Failure counters live in
//! the repository so streaks survive a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::Node;

/// Source of nodes to supervise. The supervisor does not care which store
/// backs it.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn select(&self) -> Result<Vec<Node>>;
    async fn update(&self, node: &Node) -> Result<()>;
}

/// Persisted consecutive-failure tally per node.
#[async_trait]
pub trait CheckCounter: Send + Sync {
    async fn increment(&self, id: i64) -> Result<i64>;
    async fn update(&self, id: i64, value: i64) -> Result<()>;
}

pub struct Config {
    /// Tick period between probe cycles.
    pub interval: Duration,

    /// Maximum in-flight probes during a cycle.
    pub concurrency: usize,

    /// Consecutive failures at which a node is deactivated.
    pub max_failures: i64,

    /// Shared probe transport; its timeout bounds the cycle drain time on
    /// shutdown.
    pub http_client: reqwest::Client,

    pub registry: Arc<dyn NodeRegistry>,
    pub checks: Arc<dyn CheckCounter>,
}

/// Handle to the running supervisor.
pub struct Health {
    add: mpsc::UnboundedSender<Node>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Pushes newly created nodes into the supervisor's working set.
#[derive(Clone)]
pub struct Notifier {
    add: mpsc::UnboundedSender<Node>,
}

impl Notifier {
    pub fn new(add: mpsc::UnboundedSender<Node>) -> Self {
        Self { add }
    }

    /// Hand a node to the supervisor. Never blocks; the queue is
    /// unbounded, so nothing is dropped while the supervisor runs. A send
    /// after the supervisor stopped is discarded.
    pub fn add(&self, node: Node) {
        if self.add.send(node).is_err() {
            tracing::debug!("supervisor stopped, discarding node notification");
        }
    }
}

impl Health {
    /// Load the initial working set and spawn the scheduler task. Failing
    /// to load the set is fatal: the supervisor is not started.
    pub async fn start(config: Config) -> Result<Self> {
        let initial = config.registry.select().await?;
        let mut nodes = HashMap::with_capacity(initial.len());
        for node in initial {
            nodes.insert(node.id, node);
        }
        tracing::info!(nodes = nodes.len(), "health supervisor starting");

        let (add, add_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let scheduler = Scheduler {
            config,
            nodes,
            add: add_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(scheduler.run());

        Ok(Self { add, cancel, task })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.add.clone())
    }

    /// Cancel the scheduler and wait for it to drain the current cycle.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "health scheduler task failed");
        }
    }
}

struct Scheduler {
    config: Config,
    nodes: HashMap<i64, Node>,
    add: mpsc::UnboundedReceiver<Node>,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = self.add.recv() => match received {
                    Some(node) => self.admit(node),
                    // Every handle is gone; nothing can reach us anymore.
                    None => return,
                },
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.cycle().await,
            }
        }
    }

    /// Fold a creation notification into the working set.
    fn admit(&mut self, node: Node) {
        tracing::debug!(node_id = node.id, "received node creation notification");
        // Re-adding a known id refreshes the entry.
        self.nodes.insert(node.id, node);
    }

    /// One probe cycle over the working set. Joins every probe before
    /// applying removals, so the map is never mutated mid-iteration.
    async fn cycle(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let cancel = self.cancel.child_token();
        let mut probes: JoinSet<(i64, Verdict)> = JoinSet::new();

        for (&id, node) in &self.nodes {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while the cycle runs.
                Err(_) => break,
            };
            let probe = Probe {
                client: self.config.http_client.clone(),
                registry: Arc::clone(&self.config.registry),
                checks: Arc::clone(&self.config.checks),
                max_failures: self.config.max_failures,
                cancel: cancel.clone(),
            };
            let node = node.clone();
            probes.spawn(async move {
                let verdict = probe.run(&node, permit).await;
                (id, verdict)
            });
        }

        let mut removals = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, Verdict::Remove)) => removals.push(id),
                Ok((_, Verdict::Keep)) => {}
                Err(err) => tracing::error!(error = %err, "probe task failed"),
            }
        }
        for id in removals {
            self.nodes.remove(&id);
        }
    }
}

enum Verdict {
    Keep,
    Remove,
}

struct Probe {
    client: reqwest::Client,
    registry: Arc<dyn NodeRegistry>,
    checks: Arc<dyn CheckCounter>,
    max_failures: i64,
    cancel: CancellationToken,
}

impl Probe {
    async fn run(self, node: &Node, permit: OwnedSemaphorePermit) -> Verdict {
        let healthy = self.probe(node).await;
        // The slot frees as soon as the HTTP call returns; counter and
        // repository writes happen outside the concurrency bound.
        drop(permit);

        match healthy {
            // Interrupted by shutdown: neither a success nor a failure.
            None => Verdict::Keep,
            Some(healthy) => self.check_constraint(healthy, node).await,
        }
    }

    /// Probe `{address}/health`. Healthy iff the response status is
    /// exactly 200. Returns `None` when cancelled mid-flight.
    async fn probe(&self, node: &Node) -> Option<bool> {
        let address = format!("{}/health", node.address);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            response = self.client.get(&address).send() => response,
        };

        match response {
            Ok(response) if response.status() == StatusCode::OK => Some(true),
            Ok(response) => {
                tracing::warn!(
                    node_id = node.id,
                    status = %response.status(),
                    "invalid status code from the node health endpoint",
                );
                Some(false)
            }
            Err(err) => {
                tracing::warn!(node_id = node.id, error = %err, "failed to check the health of the node");
                Some(false)
            }
        }
    }

    /// Apply the probe result to the persisted counter and decide whether
    /// the node stays in the working set. Repository errors are logged and
    /// the node kept.
    async fn check_constraint(&self, healthy: bool, node: &Node) -> Verdict {
        if healthy {
            match self.checks.update(node.id, 0).await {
                Ok(()) => {}
                // No failure streak recorded yet, nothing to reset.
                Err(Error::NotFound(_)) => {}
                Err(err) => {
                    tracing::error!(node_id = node.id, error = %err, "failed to reset the failure counter");
                }
            }
            return Verdict::Keep;
        }

        let count = match self.checks.increment(node.id).await {
            Ok(count) => count,
            Err(err) => {
                tracing::error!(node_id = node.id, error = %err, "failed to increment the failure counter");
                return Verdict::Keep;
            }
        };
        if count < self.max_failures {
            return Verdict::Keep;
        }

        let mut retired = node.clone();
        retired.active = false;
        match self.registry.update(&retired).await {
            Ok(()) => {
                tracing::info!(node_id = node.id, failures = count, "node deactivated");
                Verdict::Remove
            }
            Err(err) => {
                // Kept in the set; deactivation is retried next cycle as
                // the counter keeps growing.
                tracing::error!(node_id = node.id, error = %err, "failed to deactivate the node");
                Verdict::Keep
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use chrono::Utc;

    use super::*;
    use crate::store::node::Nodes;
    use crate::store::node_check::NodeChecks;
    use crate::store::sqlite::{Client, TxAccess};

    struct Harness {
        client: Client,
        nodes: Arc<Nodes>,
        checks: Arc<NodeChecks>,
    }

    async fn harness() -> Harness {
        let client = Client::memory().await;
        client.start().await.unwrap();
        let nodes = Arc::new(Nodes::new(client.pool()));
        let checks = Arc::new(NodeChecks::new(client.pool()));
        Harness {
            client,
            nodes,
            checks,
        }
    }

    impl Harness {
        fn config(&self, interval: Duration, concurrency: usize, max_failures: i64) -> Config {
            Config {
                interval,
                concurrency,
                max_failures,
                http_client: reqwest::Client::new(),
                registry: Arc::clone(&self.nodes) as Arc<dyn NodeRegistry>,
                checks: Arc::clone(&self.checks) as Arc<dyn CheckCounter>,
            }
        }

        async fn insert_node(&self, address: &str) -> Node {
            let draft = Node {
                id: 0,
                address: address.to_string(),
                metadata: HashMap::new(),
                ttl: Duration::ZERO,
                active: true,
                created_at: Utc::now(),
            };
            let mut tx = self.client.begin(TxAccess::ReadWrite).await.unwrap();
            let node = self.nodes.insert(&mut tx, draft).await.unwrap();
            tx.commit().await.unwrap();
            node
        }

        async fn scheduler(&self, config: Config) -> (Scheduler, mpsc::UnboundedSender<Node>) {
            let initial = self.nodes.select().await.unwrap();
            let mut map = HashMap::new();
            for node in initial {
                map.insert(node.id, node);
            }
            let (add_tx, add_rx) = mpsc::unbounded_channel();
            let scheduler = Scheduler {
                config,
                nodes: map,
                add: add_rx,
                cancel: CancellationToken::new(),
            };
            (scheduler, add_tx)
        }

        async fn count(&self, id: i64) -> i64 {
            sqlx::query_scalar("SELECT count FROM node_check WHERE id = ?1")
                .bind(id)
                .fetch_one(&self.client.pool())
                .await
                .unwrap()
        }
    }

    async fn stub_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        address
    }

    async fn healthy_stub() -> String {
        stub_server(Router::new().route("/health", get(|| async { StatusCode::OK }))).await
    }

    /// Healthy stub that counts its hits and holds each probe for `delay`.
    async fn counting_stub(hits: Arc<AtomicUsize>, delay: Duration) -> String {
        let handler = move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                StatusCode::OK
            }
        };
        stub_server(Router::new().route("/health", get(handler))).await
    }

    async fn failing_stub() -> String {
        stub_server(Router::new().route(
            "/health",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await
    }

    #[tokio::test]
    async fn healthy_probe_resets_the_failure_counter() {
        let harness = harness().await;
        let address = healthy_stub().await;
        let node = harness.insert_node(&address).await;
        harness.checks.increment(node.id).await.unwrap();
        harness.checks.increment(node.id).await.unwrap();

        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        scheduler.cycle().await;

        assert_eq!(harness.count(node.id).await, 0);
        assert!(scheduler.nodes.contains_key(&node.id));
    }

    #[tokio::test]
    async fn failing_probe_increments_the_counter_and_keeps_the_node() {
        let harness = harness().await;
        let address = failing_stub().await;
        let node = harness.insert_node(&address).await;

        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        scheduler.cycle().await;

        assert_eq!(harness.count(node.id).await, 1);
        assert!(scheduler.nodes.contains_key(&node.id));
        assert!(harness.nodes.select_one(node.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn threshold_breach_deactivates_and_prunes_the_node() {
        let harness = harness().await;
        let address = failing_stub().await;
        let node = harness.insert_node(&address).await;

        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        scheduler.cycle().await;
        scheduler.cycle().await;
        scheduler.cycle().await;

        assert!(!scheduler.nodes.contains_key(&node.id));
        assert!(!harness.nodes.select_one(node.id).await.unwrap().active);
        assert!(harness.nodes.select().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_node_counts_as_a_failure() {
        let harness = harness().await;
        // Nothing listens here; the connection is refused.
        let node = harness.insert_node("http://127.0.0.1:1").await;

        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        scheduler.cycle().await;

        assert_eq!(harness.count(node.id).await, 1);
    }

    #[tokio::test]
    async fn cycle_bounds_the_number_of_inflight_probes() {
        let harness = harness().await;

        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let inflight = Arc::clone(&inflight);
            let peak = Arc::clone(&peak);
            move || {
                let inflight = Arc::clone(&inflight);
                let peak = Arc::clone(&peak);
                async move {
                    let current = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    inflight.fetch_sub(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }
        };
        let address = stub_server(Router::new().route("/health", get(handler))).await;
        for _ in 0..5 {
            harness.insert_node(&address).await;
        }

        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 2, 3))
            .await;
        let started = std::time::Instant::now();
        scheduler.cycle().await;

        // Five 100ms probes two at a time need at least three waves.
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cycle_with_an_empty_working_set_is_a_noop() {
        let harness = harness().await;
        let (mut scheduler, _add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        scheduler.cycle().await;
        assert!(scheduler.nodes.is_empty());
    }

    struct BrokenRegistry;

    #[async_trait]
    impl NodeRegistry for BrokenRegistry {
        async fn select(&self) -> Result<Vec<Node>> {
            Err(Error::NotFound("node"))
        }

        async fn update(&self, _node: &Node) -> Result<()> {
            Err(Error::NotFound("node"))
        }
    }

    #[tokio::test]
    async fn start_fails_when_the_initial_load_fails() {
        let harness = harness().await;
        let config = Config {
            interval: Duration::from_secs(60),
            concurrency: 4,
            max_failures: 3,
            http_client: reqwest::Client::new(),
            registry: Arc::new(BrokenRegistry),
            checks: Arc::clone(&harness.checks) as Arc<dyn CheckCounter>,
        };
        assert!(Health::start(config).await.is_err());
    }

    /// Registry wrapper whose updates always fail, leaving reads intact.
    struct ReadOnlyRegistry {
        inner: Arc<Nodes>,
    }

    #[async_trait]
    impl NodeRegistry for ReadOnlyRegistry {
        async fn select(&self) -> Result<Vec<Node>> {
            self.inner.select().await
        }

        async fn update(&self, _node: &Node) -> Result<()> {
            Err(Error::Integrity { affected: 0 })
        }
    }

    #[tokio::test]
    async fn failed_deactivation_keeps_the_node_for_retry() {
        let harness = harness().await;
        let address = failing_stub().await;
        let node = harness.insert_node(&address).await;

        let mut config = harness.config(Duration::from_secs(60), 4, 1);
        config.registry = Arc::new(ReadOnlyRegistry {
            inner: Arc::clone(&harness.nodes),
        });
        let (mut scheduler, _add) = harness.scheduler(config).await;

        scheduler.cycle().await;
        assert!(scheduler.nodes.contains_key(&node.id));
        assert_eq!(harness.count(node.id).await, 1);

        scheduler.cycle().await;
        assert!(scheduler.nodes.contains_key(&node.id));
        assert_eq!(harness.count(node.id).await, 2);
    }

    #[tokio::test]
    async fn a_node_added_mid_cycle_is_probed_only_from_the_next_cycle() {
        let harness = harness().await;

        let slow_hits = Arc::new(AtomicUsize::new(0));
        let slow_address = counting_stub(Arc::clone(&slow_hits), Duration::from_millis(200)).await;
        let late_hits = Arc::new(AtomicUsize::new(0));
        let late_address = counting_stub(Arc::clone(&late_hits), Duration::ZERO).await;

        harness.insert_node(&slow_address).await;
        let (mut scheduler, add) = harness
            .scheduler(harness.config(Duration::from_secs(60), 4, 3))
            .await;
        let late_node = harness.insert_node(&late_address).await;

        // Lands on the channel while the slow probe keeps the cycle busy.
        let send = {
            let late_node = late_node.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                add.send(late_node).unwrap();
            })
        };

        scheduler.cycle().await;
        send.await.unwrap();

        // The in-flight cycle never saw the late node.
        assert_eq!(slow_hits.load(Ordering::SeqCst), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        assert!(!scheduler.nodes.contains_key(&late_node.id));

        // The scheduler drains the notification before the next tick.
        let received = scheduler.add.recv().await.unwrap();
        scheduler.admit(received);
        assert!(scheduler.nodes.contains_key(&late_node.id));

        scheduler.cycle().await;
        assert_eq!(slow_hits.load(Ordering::SeqCst), 2);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn added_nodes_join_the_set_and_are_probed_on_later_cycles() {
        let harness = harness().await;
        let address = failing_stub().await;

        let health = Health::start(harness.config(Duration::from_millis(50), 4, 100))
            .await
            .unwrap();
        let notifier = health.notifier();

        let node = harness.insert_node(&address).await;
        notifier.add(node.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        health.stop().await;

        assert!(harness.count(node.id).await >= 1);
    }

    #[tokio::test]
    async fn nodes_loaded_at_startup_are_probed() {
        let harness = harness().await;
        let address = failing_stub().await;
        let node = harness.insert_node(&address).await;

        let health = Health::start(harness.config(Duration::from_millis(50), 4, 100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        health.stop().await;

        assert!(harness.count(node.id).await >= 1);
    }
}
