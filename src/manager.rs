//! Shardstore group manager.
//!
//! Hosts one consensus group per database. Every group gets its own storage
//! directory under the node's base path, its own state machine and engine,
//! and its own transport, all sharing the node's [`MuxListener`].

use crate::command::RawCommand;
use crate::config::{Config, Peer};
use crate::errors::StoreError;
use crate::mux::{MuxListener, GROUP_TAG_LEN};
use crate::server::{Role, ServerOptions, StoreServer};
use crate::state_machine::{AppliedCommand, ApplyReport, QueryResults, SqlStateMachine};
use crate::transport::{decode_membership, encode_membership, GroupTransport};
use derivative::Derivative;
use log::{error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

const MEMBERSHIP_FILE: &str = "raft-stable";

/// Point-in-time view of one hosted group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    /// Group identity.
    pub group: String,
    /// Role of the local replica.
    pub role: Role,
    /// Current leader, if known.
    pub leader_id: Option<usize>,
    /// Peer endpoint of the current leader, if known.
    pub leader_addr: Option<SocketAddr>,
    /// Index of the last entry applied locally since the engine started.
    pub applied_index: usize,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Group {
    server: Arc<StoreServer<GroupTransport>>,
    transport: Arc<GroupTransport>,
    #[derivative(Debug = "ignore")]
    engine: Mutex<Option<JoinHandle<()>>>,
}

/// Hosts the consensus groups of one node.
#[derive(Debug)]
pub struct GroupManager {
    config: Config,
    listener: Arc<MuxListener>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

/// Checks that `id` can serve as a directory name and a network tag.
pub fn validate_group_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= GROUP_TAG_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidGroupId(id.to_string()))
    }
}

/// Loads the persisted membership of a group, or persists `peers` as its
/// membership if none was stored yet.
fn load_membership(dir: &Path, peers: &[Peer]) -> Result<Vec<Peer>, StoreError> {
    let path = dir.join(MEMBERSHIP_FILE);
    if path.exists() {
        let stored = decode_membership(&fs::read(&path)?)?;
        if stored != peers {
            warn!(
                "ignoring configured peers of {}, using stored membership {:?}",
                dir.display(),
                stored
            );
        }
        return Ok(stored);
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, encode_membership(peers))?;
    fs::rename(tmp, path)?;
    Ok(peers.to_vec())
}

impl GroupManager {
    /// Creates a manager serving its groups through `listener`.
    pub fn new(config: Config, listener: Arc<MuxListener>) -> Self {
        Self {
            config,
            listener,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// The node configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address of the shared peer listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Storage directory of group `id`.
    pub fn group_dir(&self, id: &str) -> PathBuf {
        self.config.base_path.join(id)
    }

    fn group(&self, id: &str) -> Result<Arc<Group>, StoreError> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::GroupNotFound(id.to_string()))
    }

    /// Creates and starts the group `id` with the given members.
    ///
    /// `peers` may include this node; its own entry is ignored. Must be
    /// called from within a tokio runtime.
    pub fn create_group(&self, id: &str, peers: &[Peer]) -> Result<(), StoreError> {
        validate_group_id(id)?;
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.contains_key(id) {
            return Err(StoreError::GroupExists(id.to_string()));
        }
        let dir = self.group_dir(id);
        fs::create_dir_all(&dir)?;
        let members = load_membership(&dir, peers)?;
        let fsm = SqlStateMachine::open(id, &dir, self.config.conn_pool_size)?;
        let incoming = self.listener.register(id)?;
        let started = GroupTransport::new(id, self.config.id, &members).and_then(|transport| {
            let transport = Arc::new(transport);
            let peer_ids = members
                .iter()
                .map(|peer| peer.id)
                .filter(|&peer_id| peer_id != self.config.id)
                .collect();
            let options = ServerOptions {
                timings: self.config.timings.clone(),
                snapshot_delta: self.config.snapshot_delta,
            };
            let server =
                StoreServer::start(id, self.config.id, peer_ids, fsm, transport.clone(), &options)?;
            Ok((transport, Arc::new(server)))
        });
        let (transport, server) = match started {
            Ok(started) => started,
            Err(e) => {
                self.listener.deregister(id);
                return Err(e);
            }
        };
        transport.serve(server.clone(), incoming);
        let engine = {
            let server = server.clone();
            tokio::task::spawn_blocking(move || {
                server.run();
            })
        };
        groups.insert(
            id.to_string(),
            Arc::new(Group {
                server,
                transport,
                engine: Mutex::new(Some(engine)),
            }),
        );
        info!(
            "node {} hosts group {} with members {:?}",
            self.config.id,
            id,
            members.iter().map(|peer| peer.id).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Submits `command` to group `id`, waiting up to the configured timeout.
    pub async fn submit(&self, id: &str, command: RawCommand) -> Result<ApplyReport, StoreError> {
        self.submit_with_timeout(id, command, self.config.submit_timeout)
            .await
    }

    /// Submits `command` to group `id`, waiting up to `timeout`.
    pub async fn submit_with_timeout(
        &self,
        id: &str,
        command: RawCommand,
        timeout: Duration,
    ) -> Result<ApplyReport, StoreError> {
        let group = self.group(id)?;
        group.server.submit(command, timeout).await
    }

    /// Reads from the local replica of group `id`.
    pub fn query(&self, id: &str, sql: &str) -> Result<QueryResults, StoreError> {
        self.group(id)?.server.query(sql)
    }

    /// Status of group `id`.
    pub fn status(&self, id: &str) -> Result<GroupStatus, StoreError> {
        let group = self.group(id)?;
        let leader_id = group.server.leader();
        let leader_addr = match leader_id {
            Some(leader) if leader == self.config.id => Some(self.listener.local_addr()),
            Some(leader) => group.transport.peer_addr(leader),
            None => None,
        };
        Ok(GroupStatus {
            group: id.to_string(),
            role: group.server.role(),
            leader_id,
            leader_addr,
            applied_index: group.server.applied_index(),
        })
    }

    /// Status of every hosted group, ordered by identity.
    pub fn statuses(&self) -> Vec<GroupStatus> {
        self.group_ids()
            .iter()
            .filter_map(|id| self.status(id).ok())
            .collect()
    }

    /// Identities of the hosted groups, sorted.
    pub fn group_ids(&self) -> Vec<String> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every statement applied to the local replica of group `id`.
    pub fn applied_commands(&self, id: &str) -> Result<Vec<AppliedCommand>, StoreError> {
        self.group(id)?.server.applied_commands()
    }

    /// At most `limit` statements applied to group `id` after audit
    /// position `after`.
    pub fn applied_commands_since(
        &self,
        id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AppliedCommand>, StoreError> {
        self.group(id)?.server.applied_commands_since(after, limit)
    }

    /// Waits until group `id` knows its leader.
    pub async fn wait_for_leader(&self, id: &str, timeout: Duration) -> Result<(), StoreError> {
        let group = self.group(id)?;
        group.server.wait_for_leader(timeout).await
    }

    /// True if this node is the running leader of every hosted group.
    pub fn all_leaders_healthy(&self) -> bool {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .values()
            .all(|group| !group.server.is_halted() && group.server.role() == Role::Leader)
    }

    /// Halts every group and releases its resources.
    pub async fn shutdown(&self) {
        let groups: Vec<_> = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, group) in groups {
            group.server.halt();
            let engine = group
                .engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(engine) = engine {
                if let Err(e) = engine.await {
                    error!("engine of group {} failed: {}", id, e);
                }
            }
            group.server.close().await;
            self.listener.deregister(&id);
            info!("node {} stopped group {}", self.config.id, id);
        }
    }
}
