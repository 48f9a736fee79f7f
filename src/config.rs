//! Shardstore node configuration.

use derivative::Derivative;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default leader heartbeat interval.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(50);
/// Default lower bound of the randomized election timeout.
pub const MIN_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);
/// Default upper bound of the randomized election timeout.
pub const MAX_ELECTION_TIMEOUT: Duration = Duration::from_millis(300);
/// Default number of applied entries between snapshots.
pub const SNAPSHOT_DELTA: usize = 1024;
/// Default size of the read connection pool per group.
pub const CONN_POOL_SIZE: usize = 4;
/// Default time a submission waits for its command to apply.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Node ID, shared by every group the node hosts.
    pub id: usize,
    /// The node's multiplexed peer endpoint.
    pub addr: SocketAddr,
}

impl Peer {
    /// Creates a new peer.
    pub fn new(id: usize, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Consensus timers.
///
/// Tighter timers fail over faster but misfire more often under load.
#[derive(Clone, Debug)]
pub struct Timings {
    /// Leader heartbeat interval.
    pub heartbeat_timeout: Duration,
    /// Randomized election timeout range.
    pub election_timeout: (Duration, Duration),
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            election_timeout: (MIN_ELECTION_TIMEOUT, MAX_ELECTION_TIMEOUT),
        }
    }
}

/// Shardstore node configuration.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Config {
    /// The ID of this node.
    pub id: usize,
    /// Directory holding one subdirectory per hosted group.
    pub base_path: PathBuf,
    /// Address of the multiplexed peer listener.
    pub listen_addr: SocketAddr,
    /// Address of the client RPC service.
    pub rpc_addr: SocketAddr,
    /// The other members of every hosted group.
    pub peers: Vec<Peer>,
    /// Groups created when the node starts.
    pub groups: Vec<String>,
    /// Consensus timers.
    pub timings: Timings,
    /// Applied entries between snapshots; zero disables snapshotting.
    pub snapshot_delta: usize,
    /// Read connections per group.
    #[derivative(Debug = "ignore")]
    pub conn_pool_size: usize,
    /// Default submission timeout for RPC callers that give none.
    pub submit_timeout: Duration,
}

impl Config {
    /// Creates a configuration with default tunables.
    pub fn new(id: usize, base_path: impl Into<PathBuf>, listen_addr: SocketAddr) -> Self {
        let mut rpc_addr = listen_addr;
        rpc_addr.set_port(0);
        Self {
            id,
            base_path: base_path.into(),
            listen_addr,
            rpc_addr,
            peers: Vec::new(),
            groups: Vec::new(),
            timings: Timings::default(),
            snapshot_delta: SNAPSHOT_DELTA,
            conn_pool_size: CONN_POOL_SIZE,
            submit_timeout: SUBMIT_TIMEOUT,
        }
    }
}
