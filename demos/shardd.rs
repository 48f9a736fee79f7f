use anyhow::{anyhow, Result};
use shardstore::{Config, Node, Peer};
use std::net::SocketAddr;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "shardd")]
struct Opt {
    /// The ID of this server.
    #[structopt(short, long)]
    id: usize,
    /// Peers as `<id>=<host>:<port>`.
    #[structopt(short, long, required = false, parse(try_from_str = parse_peer))]
    peers: Vec<Peer>,
    /// Databases hosted by this server.
    #[structopt(short, long, required = false)]
    groups: Vec<String>,
    /// Directory holding the databases.
    #[structopt(short, long, default_value = "shardstore-data")]
    data_dir: PathBuf,
}

/// Peer listener address of node `id`.
fn node_addr(id: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50000 + id as u16))
}

/// Client RPC address of node `id`.
fn rpc_addr(id: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 60000 + id as u16))
}

fn parse_peer(s: &str) -> Result<Peer> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <id>=<host>:<port>, got {}", s))?;
    Ok(Peer::new(id.parse()?, addr.parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();
    let mut config = Config::new(
        opt.id,
        opt.data_dir.join(format!("node{}", opt.id)),
        node_addr(opt.id),
    );
    config.rpc_addr = rpc_addr(opt.id);
    config.peers = opt.peers;
    config.groups = opt.groups;
    let node = Node::new(config);
    node.run().await?;
    Ok(())
}
