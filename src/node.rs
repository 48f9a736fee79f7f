//! Shardstore node.

use crate::config::Config;
use crate::manager::GroupManager;
use crate::mux::MuxListener;
use crate::rpc::proto::rpc_server::RpcServer;
use crate::rpc::RpcService;
use anyhow::Result;
use log::info;
use std::sync::Arc;
use tonic::transport::Server;

/// A node hosting the configured groups and serving the client RPC API.
#[derive(Debug)]
pub struct Node {
    /// Configuration of this node.
    config: Config,
}

impl Node {
    /// Creates a new `Node` object.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Binds the peer listener and starts every configured group.
    pub async fn start(&self) -> Result<Arc<GroupManager>> {
        let listener = MuxListener::bind(self.config.listen_addr).await?;
        let manager = Arc::new(GroupManager::new(self.config.clone(), Arc::new(listener)));
        for group in &self.config.groups {
            manager.create_group(group, &self.config.peers)?;
        }
        Ok(manager)
    }

    /// Runs the node until interrupted.
    pub async fn run(&self) -> Result<()> {
        let manager = self.start().await?;
        let rpc = RpcService::new(manager.clone());
        let rpc_listen_addr = self.config.rpc_addr;
        info!("RPC listening to {} ...", rpc_listen_addr);
        let served = Server::builder()
            .add_service(RpcServer::new(rpc))
            .serve_with_shutdown(rpc_listen_addr, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        info!("node {} shutting down", self.config.id);
        manager.shutdown().await;
        served?;
        Ok(())
    }
}
