//! In-process cluster transport.
//!
//! External RPC is a surrounding concern; the consensus engine only needs a
//! way to reach peers. The router maps raft node ids to live peers in this
//! process, which is also exactly what the multi-node tests need.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::RPCOption;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{RaftNetwork, RaftNetworkFactory};

use crate::raft::types::{Node, NodeId, TypeConfig};

/// A reachable consensus endpoint.
#[async_trait]
pub trait RaftPeer: Send + Sync {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>;
    async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>;
    async fn vote(
        &self,
        req: VoteRequest<NodeId>,
    ) -> Result<VoteResponse<NodeId>, RaftError<NodeId>>;
}

/// Registry of live peers. Every store in a cluster shares one router;
/// closing a store deregisters it and peers see it as unreachable.
#[derive(Clone, Default)]
pub struct ClusterRouter {
    targets: Arc<Mutex<HashMap<NodeId, Arc<dyn RaftPeer>>>>,
}

impl ClusterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, node_id: NodeId, target: Arc<dyn RaftPeer>) {
        self.targets.lock().unwrap().insert(node_id, target);
    }

    pub(crate) fn deregister(&self, node_id: NodeId) {
        self.targets.lock().unwrap().remove(&node_id);
    }

    fn target(&self, node_id: NodeId) -> Option<Arc<dyn RaftPeer>> {
        self.targets.lock().unwrap().get(&node_id).cloned()
    }
}

fn unreachable<E>(target: NodeId) -> RPCError<NodeId, Node, E>
where
    E: std::error::Error,
{
    let err = std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("node {target} is not reachable"),
    );
    RPCError::Unreachable(Unreachable::new(&err))
}

pub struct Connection {
    target: NodeId,
    router: ClusterRouter,
}

impl RaftNetwork<TypeConfig> for Connection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        match self.router.target(self.target) {
            Some(peer) => peer
                .append_entries(req)
                .await
                .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e))),
            None => Err(unreachable(self.target)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        match self.router.target(self.target) {
            Some(peer) => peer
                .install_snapshot(req)
                .await
                .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e))),
            None => Err(unreachable(self.target)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        match self.router.target(self.target) {
            Some(peer) => peer
                .vote(req)
                .await
                .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e))),
            None => Err(unreachable(self.target)),
        }
    }
}

#[derive(Clone)]
pub struct Network {
    router: ClusterRouter,
}

impl Network {
    pub(crate) fn new(router: ClusterRouter) -> Self {
        Self { router }
    }
}

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = Connection;

    async fn new_client(&mut self, target: NodeId, _node: &Node) -> Self::Network {
        Connection {
            target,
            router: self.router.clone(),
        }
    }
}
