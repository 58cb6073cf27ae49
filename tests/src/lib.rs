//! Shared test harness for flock integration tests.
//!
//! Provides [`TestCluster`]: N group members on one [`MemoryNetwork`], each
//! with a [`ViewRecorder`] attached, plus helpers to partition, heal and
//! crash members.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flock_cluster::{GroupConfig, GroupService, ListenerResult, MembershipListener};
use flock_net::{Address, Channel, MemoryChannel, MemoryNetwork};
use flock_types::{MembershipView, NodeIdentity};

/// Group every test cluster joins.
pub const GROUP: &str = "flock-it";

/// How long helpers wait for an asynchronous condition.
pub const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// View recorder
// =========================================================================

/// Which listener callback delivered a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Changed,
    Merge,
}

/// Membership listener that keeps every view it is handed.
#[derive(Default)]
pub struct ViewRecorder {
    views: Mutex<Vec<(ViewKind, MembershipView)>>,
}

impl ViewRecorder {
    pub fn views(&self) -> Vec<(ViewKind, MembershipView)> {
        self.views.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<(ViewKind, MembershipView)> {
        self.views.lock().unwrap().last().cloned()
    }

    pub fn merges(&self) -> Vec<MembershipView> {
        self.views()
            .into_iter()
            .filter(|(kind, _)| *kind == ViewKind::Merge)
            .map(|(_, view)| view)
            .collect()
    }
}

impl MembershipListener for ViewRecorder {
    fn membership_changed(&self, view: &MembershipView) -> ListenerResult {
        self.views
            .lock()
            .unwrap()
            .push((ViewKind::Changed, view.clone()));
        Ok(())
    }

    fn membership_changed_during_merge(&self, view: &MembershipView) -> ListenerResult {
        self.views
            .lock()
            .unwrap()
            .push((ViewKind::Merge, view.clone()));
        Ok(())
    }
}

// =========================================================================
// Cluster
// =========================================================================

/// One started member.
pub struct TestNode {
    pub name: String,
    pub service: GroupService,
    pub channel: Arc<MemoryChannel>,
    pub recorder: Arc<ViewRecorder>,
}

impl TestNode {
    pub fn identity(&self) -> NodeIdentity {
        self.service.local_node().expect("node not started")
    }

    pub fn address(&self) -> Address {
        self.channel.local_address()
    }
}

/// An in-process group of members named `node-0`, `node-1`, ...
pub struct TestCluster {
    pub net: MemoryNetwork,
    nodes: Vec<TestNode>,
    config: GroupConfig,
}

impl TestCluster {
    /// Start `n` members without flush.
    pub async fn new(n: usize) -> Self {
        Self::build(MemoryNetwork::new(), n, GroupConfig::test_config(GROUP)).await
    }

    /// Start `n` members on a network that flushes around view changes.
    pub async fn with_flush(n: usize) -> Self {
        Self::build(MemoryNetwork::with_flush(), n, GroupConfig::test_config(GROUP)).await
    }

    /// Start `n` members with a custom configuration.
    pub async fn with_config(n: usize, config: GroupConfig) -> Self {
        Self::build(MemoryNetwork::new(), n, config).await
    }

    /// Start `n` members with a custom configuration on a flushing network.
    pub async fn with_flush_config(n: usize, config: GroupConfig) -> Self {
        Self::build(MemoryNetwork::with_flush(), n, config).await
    }

    async fn build(net: MemoryNetwork, n: usize, config: GroupConfig) -> Self {
        let mut cluster = Self {
            net,
            nodes: Vec::with_capacity(n),
            config,
        };
        for _ in 0..n {
            cluster.add_node().await;
        }
        cluster
    }

    /// Build a member without starting it.
    pub fn prepare_node(&self, name: &str) -> TestNode {
        let channel = self.net.channel(name);
        let service = GroupService::new(channel.clone(), self.config.clone()).unwrap();
        let recorder = Arc::new(ViewRecorder::default());
        service.register_membership_listener(recorder.clone(), false);
        TestNode {
            name: name.to_string(),
            service,
            channel,
            recorder,
        }
    }

    /// Start one more member and return its index.
    pub async fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let node = self.prepare_node(&format!("node-{index}"));
        node.service.start().await.unwrap();
        self.nodes.push(node);
        index
    }

    /// Adopt a member started by the test.
    pub fn push(&mut self, node: TestNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    pub fn service(&self, i: usize) -> &GroupService {
        &self.nodes[i].service
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Split the group; each inner slice lists member indices.
    pub fn partition(&self, sides: &[&[usize]]) {
        let splits: Vec<Vec<Address>> = sides
            .iter()
            .map(|side| side.iter().map(|i| self.nodes[*i].address()).collect())
            .collect();
        self.net.partition(GROUP, &splits);
    }

    pub fn heal(&self) {
        self.net.heal(GROUP);
    }

    /// Drop member `i` without a clean leave.
    pub fn crash(&self, i: usize) {
        self.net.crash(self.nodes[i].address());
    }

    /// Stop member `i` cleanly.
    pub async fn stop(&self, i: usize) {
        self.nodes[i].service.stop().await;
    }

    /// Names of member `i`'s current view.
    pub fn view_names(&self, i: usize) -> Vec<String> {
        self.nodes[i].service.current_view_names()
    }

    /// Wait until member `i`'s listener has seen at least `count` views.
    pub async fn wait_for_notifications(&self, i: usize, count: usize) {
        let recorder = self.nodes[i].recorder.clone();
        wait_until(move || recorder.views().len() >= count).await;
    }
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
