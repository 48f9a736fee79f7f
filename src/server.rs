//! Shardstore group server module.
//!
//! A [`StoreServer`] drives one consensus group: it owns the group's
//! `little_raft` replica and the [`SqlStateMachine`] that replica applies
//! committed entries to.

use crate::command::RawCommand;
use crate::config::Timings;
use crate::errors::StoreError;
use crate::state_machine::{self, AppliedCommand, ApplyReport, QueryResults, SqlStateMachine};
use async_notify::Notify;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel as channel;
use crossbeam_channel::{Receiver, Sender};
use derivative::Derivative;
use little_raft::{
    cluster::Cluster,
    message::Message,
    replica::{Replica, ReplicaID},
    state_machine::{Snapshot, StateMachine, StateMachineTransition, TransitionState},
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Shardstore transport layer.
///
/// Carries the consensus messages of one group to the other members of
/// that group.
#[async_trait]
pub trait StoreTransport {
    /// Send a store command message `msg` to `to_id` node.
    fn send(&self, to_id: usize, msg: Message<StoreCommand, Bytes>);

    /// Close every outbound link of this transport.
    async fn close(&self);
}

/// Store command.
///
/// A store command is a raw command that is replicated in a group.
#[derive(Clone, Debug)]
pub struct StoreCommand {
    /// Unique ID of this command.
    pub id: usize,
    /// The command payload.
    pub command: RawCommand,
}

impl StateMachineTransition for StoreCommand {
    type TransitionID = usize;

    fn get_id(&self) -> Self::TransitionID {
        self.id
    }
}

/// Consensus role of a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Following a known leader.
    Follower,
    /// No leader is known; an election is under way.
    Candidate,
    /// Leading the group.
    Leader,
}

/// Options a group server is started with.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Consensus timers.
    pub timings: Timings,
    /// Applied entries between snapshots; zero disables snapshotting.
    pub snapshot_delta: usize,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Store<T: StoreTransport + Send + Sync> {
    /// Group this store belongs to.
    group: String,
    /// ID of the node this Cluster object is on.
    this_id: usize,
    /// Current leader, if known.
    leader: Option<usize>,
    role: Role,
    leader_exists: AtomicBool,
    waiters: Vec<Arc<Notify>>,
    /// Pending messages
    #[derivative(Debug = "ignore")]
    pending_messages: Vec<Message<StoreCommand, Bytes>>,
    /// Transport layer.
    #[derivative(Debug = "ignore")]
    transport: Arc<T>,
    fsm: SqlStateMachine,
    /// Latest snapshot taken or installed since the engine started.
    #[derivative(Debug = "ignore")]
    snapshot: Option<Snapshot<Bytes>>,
    pending_transitions: Vec<StoreCommand>,
    command_completions: HashMap<usize, Arc<Notify>>,
    results: HashMap<usize, Result<ApplyReport, StoreError>>,
    halted: Arc<AtomicBool>,
}

impl<T: StoreTransport + Send + Sync> Store<T> {
    fn new(
        group: &str,
        this_id: usize,
        fsm: SqlStateMachine,
        transport: Arc<T>,
        halted: Arc<AtomicBool>,
    ) -> Self {
        Store {
            group: group.to_string(),
            this_id,
            leader: None,
            role: Role::Follower,
            leader_exists: AtomicBool::new(false),
            waiters: Vec::new(),
            pending_messages: Vec::new(),
            transport,
            fsm,
            snapshot: None,
            pending_transitions: Vec::new(),
            command_completions: HashMap::new(),
            results: HashMap::new(),
            halted,
        }
    }

    fn is_leader(&self) -> bool {
        match self.leader {
            Some(id) => id == self.this_id,
            _ => false,
        }
    }

    fn check_failure(&self) {
        if let Some(failure) = self.fsm.failure() {
            if !self.halted.swap(true, Ordering::SeqCst) {
                error!("[{}] halting group: {}", self.group, failure);
            }
        }
    }
}

impl<T: StoreTransport + Send + Sync> StateMachine<StoreCommand, Bytes> for Store<T> {
    fn register_transition_state(&mut self, transition_id: usize, state: TransitionState) {
        match state {
            TransitionState::Applied | TransitionState::Abandoned(_) => {
                if let Some(completion) = self.command_completions.remove(&transition_id) {
                    completion.notify();
                }
            }
            _ => (),
        }
    }

    fn apply_transition(&mut self, transition: StoreCommand) {
        let index = self.fsm.applied_index() + 1;
        if transition.id == NOP_TRANSITION_ID {
            self.fsm.apply_noop(index);
            return;
        }
        let report = self.fsm.apply(index, transition.id as u64, &transition.command);
        self.check_failure();
        if self.command_completions.contains_key(&transition.id) {
            self.results.insert(transition.id, Ok(report));
        }
    }

    fn get_pending_transitions(&mut self) -> Vec<StoreCommand> {
        let cur = self.pending_transitions.clone();
        self.pending_transitions = Vec::new();
        cur
    }

    fn get_snapshot(&mut self) -> Option<Snapshot<Bytes>> {
        self.snapshot.clone()
    }

    fn create_snapshot(&mut self, index: usize, term: usize) -> Snapshot<Bytes> {
        let data = match self.fsm.snapshot(index, term) {
            Ok(data) => data,
            Err(e) => {
                error!("[{}] snapshot at index {} failed: {}", self.group, index, e);
                self.halted.store(true, Ordering::SeqCst);
                Bytes::new()
            }
        };
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        };
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    fn set_snapshot(&mut self, snapshot: Snapshot<Bytes>) {
        match self.fsm.restore(&snapshot.data) {
            Ok(_) => {
                info!(
                    "[{}] installed snapshot up to index {}",
                    self.group, snapshot.last_included_index
                );
                self.snapshot = Some(snapshot);
            }
            Err(e) => {
                error!("[{}] snapshot install failed: {}", self.group, e);
                self.halted.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl<T: StoreTransport + Send + Sync> Cluster<StoreCommand, Bytes> for Store<T> {
    fn register_leader(&mut self, leader_id: Option<ReplicaID>) {
        let role = match leader_id {
            Some(id) if id == self.this_id => Role::Leader,
            Some(_) => Role::Follower,
            None => Role::Candidate,
        };
        if self.leader != leader_id {
            info!(
                "[{}] node {} is now {:?}, leader {:?}",
                self.group, self.this_id, role, leader_id
            );
        }
        self.leader = leader_id;
        self.role = role;
        self.leader_exists.store(leader_id.is_some(), Ordering::SeqCst);
        let waiters = self.waiters.clone();
        self.waiters = Vec::new();
        for waiter in waiters {
            waiter.notify();
        }
    }

    fn send_message(&mut self, to_id: usize, message: Message<StoreCommand, Bytes>) {
        self.transport.send(to_id, message);
    }

    fn receive_messages(&mut self) -> Vec<Message<StoreCommand, Bytes>> {
        let cur = self.pending_messages.clone();
        self.pending_messages = Vec::new();
        cur
    }

    fn halt(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

type StoreReplica<T> = Replica<Store<T>, Store<T>, StoreCommand, Bytes>;

/// Command ID of the engine no-op.
pub const NOP_TRANSITION_ID: usize = 0;

const SEQUENCE_BITS: u32 = 48;

/// Largest node ID that fits above the command sequence bits.
pub const MAX_NODE_ID: usize = (1 << (64 - SEQUENCE_BITS)) - 1;

/// Shardstore group server.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StoreServer<T: StoreTransport + Send + Sync> {
    group: String,
    this_id: usize,
    next_cmd_id: AtomicUsize,
    store: Arc<Mutex<Store<T>>>,
    #[derivative(Debug = "ignore")]
    replica: Arc<Mutex<StoreReplica<T>>>,
    halted: Arc<AtomicBool>,
    message_notifier_rx: Receiver<()>,
    message_notifier_tx: Sender<()>,
    transition_notifier_rx: Receiver<()>,
    transition_notifier_tx: Sender<()>,
}

pub(crate) fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// First command ID handed out by node `this_id`.
///
/// The node ID occupies the high bits so IDs never collide across nodes; the
/// random sequence start keeps them apart across restarts of the same node.
fn first_command_id(this_id: usize) -> usize {
    let sequence = rand::random::<u64>() & ((1u64 << SEQUENCE_BITS) - 1);
    let id = ((this_id as u64) << SEQUENCE_BITS) | sequence;
    if id as usize == NOP_TRANSITION_ID {
        1
    } else {
        id as usize
    }
}

impl<T: StoreTransport + Send + Sync> StoreServer<T> {
    /// Start a new server as a member of `group`.
    ///
    /// `peers` are the IDs of the other members; the engine loop does not run
    /// until [`StoreServer::run`] is called.
    pub fn start(
        group: &str,
        this_id: usize,
        peers: Vec<usize>,
        fsm: SqlStateMachine,
        transport: Arc<T>,
        options: &ServerOptions,
    ) -> Result<Self, StoreError> {
        if this_id > MAX_NODE_ID || peers.iter().any(|&id| id > MAX_NODE_ID) {
            return Err(StoreError::ConsensusInitError(format!(
                "node IDs of group {} must not exceed {}",
                group, MAX_NODE_ID
            )));
        }
        let unique: HashSet<_> = peers.iter().collect();
        if unique.len() != peers.len() || unique.contains(&this_id) {
            return Err(StoreError::ConsensusInitError(format!(
                "invalid membership for node {}: {:?}",
                this_id, peers
            )));
        }
        let (min_election, max_election) = options.timings.election_timeout;
        if min_election > max_election || options.timings.heartbeat_timeout >= min_election {
            return Err(StoreError::ConsensusInitError(format!(
                "invalid timings {:?}",
                options.timings
            )));
        }
        let halted = Arc::new(AtomicBool::new(false));
        let store = Arc::new(Mutex::new(Store::new(
            group,
            this_id,
            fsm,
            transport,
            halted.clone(),
        )));
        let noop = StoreCommand {
            id: NOP_TRANSITION_ID,
            command: RawCommand::empty(),
        };
        let (message_notifier_tx, message_notifier_rx) = channel::unbounded();
        let (transition_notifier_tx, transition_notifier_rx) = channel::unbounded();
        let replica = Replica::new(
            this_id,
            peers,
            store.clone(),
            store.clone(),
            options.snapshot_delta,
            noop,
            options.timings.heartbeat_timeout,
            options.timings.election_timeout,
        );
        let replica = Arc::new(Mutex::new(replica));
        Ok(StoreServer {
            group: group.to_string(),
            this_id,
            next_cmd_id: AtomicUsize::new(first_command_id(this_id)),
            store,
            replica,
            halted,
            message_notifier_rx,
            message_notifier_tx,
            transition_notifier_rx,
            transition_notifier_tx,
        })
    }

    /// Run the blocking event loop until the group is halted.
    pub fn run(&self) {
        lock(&self.replica).start(
            self.message_notifier_rx.clone(),
            self.transition_notifier_rx.clone(),
        );
        info!("[{}] consensus loop of node {} stopped", self.group, self.this_id);
    }

    /// The group this server belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Submits a command and waits until it has been applied locally.
    ///
    /// Fails immediately with [`StoreError::NotLeader`] when this replica is
    /// not the leader. When the deadline elapses the command may still
    /// commit later and [`StoreError::Timeout`] is returned.
    pub async fn submit(
        &self,
        command: RawCommand,
        timeout: Duration,
    ) -> Result<ApplyReport, StoreError> {
        if self.is_halted() {
            return Err(StoreError::GroupStopped(self.group.clone()));
        }
        let (notify, id) = {
            let mut store = lock(&self.store);
            if !store.is_leader() {
                return Err(StoreError::NotLeader);
            }
            let id = self.next_cmd_id.fetch_add(1, Ordering::SeqCst);
            let notify = Arc::new(Notify::new());
            store.command_completions.insert(id, notify.clone());
            store.pending_transitions.push(StoreCommand { id, command });
            (notify, id)
        };
        debug!("[{}] submitted command {}", self.group, id);
        if self.transition_notifier_tx.send(()).is_err() {
            lock(&self.store).command_completions.remove(&id);
            return Err(StoreError::GroupStopped(self.group.clone()));
        }
        if tokio::time::timeout(timeout, notify.notified()).await.is_err() {
            let mut store = lock(&self.store);
            store.command_completions.remove(&id);
            // The command may have been applied right at the deadline.
            if let Some(result) = store.results.remove(&id) {
                return result;
            }
            warn!("[{}] command {} timed out", self.group, id);
            return Err(StoreError::Timeout);
        }
        match lock(&self.store).results.remove(&id) {
            Some(result) => result,
            None => Err(StoreError::NotLeader),
        }
    }

    /// Runs a read against the locally applied state.
    pub fn query<S: AsRef<str>>(&self, stmt: S) -> Result<QueryResults, StoreError> {
        let conn = {
            let mut store = lock(&self.store);
            store.fsm.get_connection()
        };
        let conn = conn.ok_or_else(|| StoreError::GroupStopped(self.group.clone()))?;
        state_machine::query(conn, stmt.as_ref())
    }

    /// Wait for a leader to be elected.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), StoreError> {
        let wait = async {
            loop {
                let notify = {
                    let mut store = lock(&self.store);
                    if store.leader_exists.load(Ordering::SeqCst) {
                        break;
                    }
                    let notify = Arc::new(Notify::new());
                    store.waiters.push(notify.clone());
                    notify
                };
                notify.notified().await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::Timeout)
    }

    /// Receive a message from the group.
    pub fn recv_msg(&self, msg: Message<StoreCommand, Bytes>) {
        let mut cluster = lock(&self.store);
        cluster.pending_messages.push(msg);
        let _ = self.message_notifier_tx.send(());
    }

    /// Current consensus role of this replica.
    pub fn role(&self) -> Role {
        lock(&self.store).role
    }

    /// Current leader of the group, if known.
    pub fn leader(&self) -> Option<usize> {
        lock(&self.store).leader
    }

    /// Is this replica the leader?
    pub fn is_leader(&self) -> bool {
        lock(&self.store).is_leader()
    }

    /// Index of the last entry applied since the engine started.
    pub fn applied_index(&self) -> usize {
        lock(&self.store).fsm.applied_index()
    }

    /// Every statement applied to this replica, in execution order.
    pub fn applied_commands(&self) -> Result<Vec<AppliedCommand>, StoreError> {
        lock(&self.store).fsm.applied_commands()
    }

    /// At most `limit` statements applied after audit position `after`.
    pub fn applied_commands_since(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<AppliedCommand>, StoreError> {
        lock(&self.store).fsm.applied_commands_since(after, limit)
    }

    /// Has the group been halted?
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stops the engine loop after its current iteration.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        let _ = self.message_notifier_tx.send(());
        let _ = self.transition_notifier_tx.send(());
    }

    /// Releases the database and closes the group's peer links.
    ///
    /// Submissions still waiting fail with [`StoreError::Interrupted`].
    /// Call after the engine loop has returned.
    pub async fn close(&self) {
        let transport = {
            let mut store = lock(&self.store);
            store.fsm.close();
            let pending: Vec<_> = store.command_completions.drain().collect();
            for (id, completion) in pending {
                store
                    .results
                    .entry(id)
                    .or_insert_with(|| Err(StoreError::Interrupted(self.group.clone())));
                completion.notify();
            }
            store.transport.clone()
        };
        transport.close().await;
    }
}
