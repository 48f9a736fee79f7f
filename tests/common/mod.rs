//! Shared helpers for integration tests.

#![allow(dead_code)]

use shardstore::{
    ApplyReport, Config, GroupManager, MuxListener, Peer, RawCommand, Role, StoreError,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Timeout for elections and replication to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running node of a test cluster.
pub struct TestNode {
    pub id: usize,
    pub manager: Arc<GroupManager>,
    listener: Arc<MuxListener>,
}

/// An in-process cluster whose nodes all host the same groups.
pub struct TestCluster {
    root: TempDir,
    groups: Vec<String>,
    peers: Vec<Peer>,
    configure: fn(&mut Config),
    nodes: Vec<Option<TestNode>>,
}

fn node_dir(root: &TempDir, id: usize) -> PathBuf {
    root.path().join(format!("node{}", id))
}

async fn start_node(
    root: &TempDir,
    id: usize,
    listener: MuxListener,
    peers: &[Peer],
    groups: &[String],
    configure: fn(&mut Config),
) -> TestNode {
    let listener = Arc::new(listener);
    let mut config = Config::new(id, node_dir(root, id), listener.local_addr());
    config.peers = peers.to_vec();
    config.groups = groups.to_vec();
    configure(&mut config);
    let manager = Arc::new(GroupManager::new(config, listener.clone()));
    for group in groups {
        manager.create_group(group, peers).unwrap();
    }
    TestNode {
        id,
        manager,
        listener,
    }
}

impl TestCluster {
    /// Starts `size` nodes hosting `groups`. Node IDs start at 1.
    pub async fn start(size: usize, groups: &[&str]) -> Self {
        Self::start_with(size, groups, |_| {}).await
    }

    /// Like [`TestCluster::start`], letting `configure` adjust every node's
    /// configuration, including after restarts.
    pub async fn start_with(size: usize, groups: &[&str], configure: fn(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let mut listeners = Vec::new();
        for _ in 0..size {
            let listener = MuxListener::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            listeners.push(listener);
        }
        let peers: Vec<Peer> = listeners
            .iter()
            .enumerate()
            .map(|(i, listener)| Peer::new(i + 1, listener.local_addr()))
            .collect();
        let mut nodes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            nodes.push(Some(
                start_node(&root, i + 1, listener, &peers, &groups, configure).await,
            ));
        }
        Self {
            root,
            groups,
            peers,
            configure,
            nodes,
        }
    }

    /// The running node with ID `id`.
    pub fn node(&self, id: usize) -> &TestNode {
        self.nodes[id - 1].as_ref().expect("node is stopped")
    }

    /// IDs of the running nodes.
    pub fn running(&self) -> Vec<usize> {
        self.nodes.iter().flatten().map(|node| node.id).collect()
    }

    fn addr(&self, id: usize) -> SocketAddr {
        self.peers[id - 1].addr
    }

    /// Waits until a running node leads `group` and returns its ID.
    pub async fn wait_for_leader(&self, group: &str) -> usize {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            for id in self.running() {
                let status = self.node(id).manager.status(group).unwrap();
                if status.role == Role::Leader {
                    return id;
                }
            }
            assert!(Instant::now() < deadline, "no leader elected for {}", group);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Submits `command` to the leader of `group`, following leader changes.
    pub async fn submit(&self, group: &str, command: RawCommand) -> ApplyReport {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            let leader = self.wait_for_leader(group).await;
            match self
                .node(leader)
                .manager
                .submit(group, command.clone())
                .await
            {
                Ok(report) => return report,
                Err(StoreError::NotLeader) => {}
                Err(e) => panic!("submit to {} on node {} failed: {}", group, leader, e),
            }
            assert!(Instant::now() < deadline, "submit to {} never succeeded", group);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Runs `sql` on node `id` until it returns `expected`, flattened.
    pub async fn wait_for_rows(&self, id: usize, group: &str, sql: &str, expected: &[&str]) {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Ok(rows) = self.rows(id, group, sql) {
                if rows == expected {
                    return;
                }
            }
            if Instant::now() >= deadline {
                panic!(
                    "node {} never returned {:?} for {:?} on {}, last {:?}",
                    id,
                    expected,
                    sql,
                    group,
                    self.rows(id, group, sql)
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Directory holding node `id`'s copy of `group`.
    pub fn group_dir(&self, id: usize, group: &str) -> PathBuf {
        node_dir(&self.root, id).join(group)
    }

    /// Runs `sql` on node `id` and flattens the rows.
    pub fn rows(&self, id: usize, group: &str, sql: &str) -> Result<Vec<String>, StoreError> {
        let results = self.node(id).manager.query(group, sql)?;
        Ok(results.rows.into_iter().flat_map(|row| row.values).collect())
    }

    /// Stops node `id`, keeping its storage.
    pub async fn stop(&mut self, id: usize) {
        if let Some(node) = self.nodes[id - 1].take() {
            node.manager.shutdown().await;
            node.listener.shutdown();
        }
    }

    /// Restarts node `id` from its storage, on its old address.
    pub async fn restart(&mut self, id: usize) {
        let addr = self.addr(id);
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let listener = loop {
            match MuxListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) => {
                    assert!(Instant::now() < deadline, "cannot rebind {}: {}", addr, e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        };
        let node = start_node(
            &self.root,
            id,
            listener,
            &self.peers,
            &self.groups,
            self.configure,
        )
        .await;
        self.nodes[id - 1] = Some(node);
    }

    /// Stops every node.
    pub async fn shutdown(mut self) {
        for id in 1..=self.nodes.len() {
            self.stop(id).await;
        }
    }
}
