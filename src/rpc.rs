//! Shardstore RPC module.
//!
//! Client-facing service: submissions, local reads, node status and
//! database creation. Peer traffic does not go through here; see
//! [`crate::transport`].

use crate::command::{parse_use_query, RawCommand};
use crate::errors::StoreError;
use crate::manager::GroupManager;
use crate::rpc::proto::rpc_server::Rpc;
use crate::server::Role;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("proto");
}

use proto::{
    CreateDatabaseRequest, CreateDatabaseResult, Encoding, ExecuteRequest, ExecuteResult,
    GroupStatus, NodeStatus, Query, QueryResults, QueryRow, Void,
};

/// RPC service.
#[derive(Debug)]
pub struct RpcService {
    /// The groups served by this RPC service.
    pub manager: Arc<GroupManager>,
}

impl RpcService {
    /// Creates a new RPC service.
    pub fn new(manager: Arc<GroupManager>) -> Self {
        Self { manager }
    }

    fn to_status(&self, database: &str, e: StoreError) -> Status {
        match e {
            StoreError::GroupNotFound(_) => Status::not_found(e.to_string()),
            StoreError::GroupExists(_) => Status::already_exists(e.to_string()),
            StoreError::NotLeader => {
                let leader = self
                    .manager
                    .status(database)
                    .ok()
                    .and_then(|status| status.leader_id.zip(status.leader_addr));
                match leader {
                    Some((id, addr)) => {
                        Status::failed_precondition(format!("not leader; leader is node {} at {}", id, addr))
                    }
                    None => Status::failed_precondition(e.to_string()),
                }
            }
            StoreError::Timeout => Status::deadline_exceeded(e.to_string()),
            StoreError::InvalidGroupId(_)
            | StoreError::ParseError(_)
            | StoreError::NoDatabaseDirective => Status::invalid_argument(e.to_string()),
            StoreError::GroupStopped(_) => Status::unavailable(e.to_string()),
            StoreError::Interrupted(_) => Status::aborted(e.to_string()),
            _ => Status::internal(e.to_string()),
        }
    }
}

#[tonic::async_trait]
impl Rpc for RpcService {
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResult>, Status> {
        let request = request.into_inner();
        let encoding = Encoding::from_i32(request.encoding).unwrap_or(Encoding::Structured);
        let (database, command) = match encoding {
            Encoding::Structured => (request.database, RawCommand::structured(&request.sql)),
            Encoding::Directive => {
                let database = if request.database.is_empty() {
                    parse_use_query(&request.sql)
                        .map(|(database, _)| database)
                        .map_err(|e| self.to_status("", e))?
                } else {
                    request.database
                };
                (database, RawCommand::directive(request.sql))
            }
        };
        let timeout = match request.timeout_ms {
            0 => self.manager.config().submit_timeout,
            ms => Duration::from_millis(ms),
        };
        let report = self
            .manager
            .submit_with_timeout(&database, command, timeout)
            .await
            .map_err(|e| self.to_status(&database, e))?;
        Ok(Response::new(ExecuteResult {
            index: report.index as u64,
            errors: report.errors,
        }))
    }

    async fn query(&self, request: Request<Query>) -> Result<Response<QueryResults>, Status> {
        let query = request.into_inner();
        let results = self
            .manager
            .query(&query.database, &query.sql)
            .map_err(|e| self.to_status(&query.database, e))?;
        let rows = results
            .rows
            .into_iter()
            .map(|row| QueryRow { values: row.values })
            .collect();
        Ok(Response::new(QueryResults { rows }))
    }

    async fn status(&self, _request: Request<Void>) -> Result<Response<NodeStatus>, Status> {
        let groups = self
            .manager
            .statuses()
            .into_iter()
            .map(|status| {
                let role = match status.role {
                    Role::Follower => proto::Role::Follower,
                    Role::Candidate => proto::Role::Candidate,
                    Role::Leader => proto::Role::Leader,
                };
                GroupStatus {
                    group: status.group,
                    role: role as i32,
                    has_leader: status.leader_id.is_some(),
                    leader_id: status.leader_id.unwrap_or_default() as u64,
                    leader_addr: status
                        .leader_addr
                        .map(|addr| addr.to_string())
                        .unwrap_or_default(),
                    applied_index: status.applied_index as u64,
                }
            })
            .collect();
        Ok(Response::new(NodeStatus {
            groups,
            all_leaders_healthy: self.manager.all_leaders_healthy(),
        }))
    }

    /// Starts hosting a new database on this node. Call it on every member.
    async fn create_database(
        &self,
        request: Request<CreateDatabaseRequest>,
    ) -> Result<Response<CreateDatabaseResult>, Status> {
        let database = request.into_inner().database;
        let peers = self.manager.config().peers.clone();
        self.manager
            .create_group(&database, &peers)
            .map_err(|e| self.to_status(&database, e))?;
        let path = self.manager.group_dir(&database);
        Ok(Response::new(CreateDatabaseResult {
            path: path.display().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Peer};
    use crate::mux::MuxListener;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn databases_are_created_at_runtime() {
        let dir = tempdir().unwrap();
        let listener = MuxListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut config = Config::new(1, dir.path(), listener.local_addr());
        config.peers = vec![
            Peer::new(2, "127.0.0.1:1".parse().unwrap()),
            Peer::new(3, "127.0.0.1:2".parse().unwrap()),
        ];
        let manager = Arc::new(GroupManager::new(config, Arc::new(listener)));
        let service = RpcService::new(manager.clone());

        let created = service
            .create_database(Request::new(CreateDatabaseRequest {
                database: "shop".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(created.path, dir.path().join("shop").display().to_string());
        assert_eq!(manager.group_ids(), vec!["shop".to_string()]);

        let again = service
            .create_database(Request::new(CreateDatabaseRequest {
                database: "shop".to_string(),
            }))
            .await;
        assert_eq!(again.unwrap_err().code(), tonic::Code::AlreadyExists);
        let invalid = service
            .create_database(Request::new(CreateDatabaseRequest {
                database: "../shop".to_string(),
            }))
            .await;
        assert_eq!(invalid.unwrap_err().code(), tonic::Code::InvalidArgument);

        let status = service.status(Request::new(Void {})).await.unwrap().into_inner();
        assert_eq!(status.groups.len(), 1);
        assert_eq!(status.groups[0].group, "shop");
        manager.shutdown().await;
    }
}
