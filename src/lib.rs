//! Shardstore is multi-group replicated [SQLite][1] for Rust, powered by
//! [Little Raft][2].
//!
//! ## Getting Started
//!
//! A Shardstore node hosts many independent SQLite databases. Each database
//! is replicated by its own Raft group, so leadership, log and snapshots are
//! tracked per database, and a slow or failed group never holds up the
//! others. Every node runs one replica of every group it hosts.
//!
//! All groups of a node share a single TCP listener. A peer opens each
//! connection by writing a fixed-width tag naming the group, and the
//! listener hands the connection to that group's transport.
//!
//! Commands are submitted to the leader of a group. A command is either a
//! structured record `{"SQL": "<statement>"}` or directive text of the form
//! `USE <db>; <stmt>; <stmt>;`. Once the command commits, every replica
//! executes it inside one SQLite transaction and records each statement in
//! an audit trail, including statements that failed. Reads are served from
//! the local replica and may be stale on followers.
//!
//! Embedding a node is as simple as:
//!
//! ```no_run
//! use anyhow::Result;
//! use shardstore::{Config, Node, Peer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut config = Config::new(1, "/var/lib/shardstore", "127.0.0.1:50001".parse()?);
//!     config.rpc_addr = "127.0.0.1:60001".parse()?;
//!     config.peers = vec![
//!         Peer::new(2, "127.0.0.1:50002".parse()?),
//!         Peer::new(3, "127.0.0.1:50003".parse()?),
//!     ];
//!     config.groups = vec!["shop".to_string(), "billing".to_string()];
//!     Node::new(config).run().await
//! }
//! ```
//!
//! [1]: https://www.sqlite.org/index.html
//! [2]: https://github.com/andreev-io/little-raft

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod command;
pub mod config;
pub mod errors;
pub mod manager;
pub mod mux;
pub mod node;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod transport;

pub use command::{Command, CommandEncoding, RawCommand};
pub use config::{Config, Peer, Timings};
pub use errors::StoreError;
pub use manager::{GroupManager, GroupStatus};
pub use mux::MuxListener;
pub use node::Node;
pub use server::Role;
pub use server::StoreCommand;
pub use server::StoreServer;
pub use server::StoreTransport;
pub use state_machine::{AppliedCommand, ApplyReport, QueryResults, QueryRow};
pub use transport::GroupTransport;
