//! Consensus adapter: owns the running raft instance for one node and
//! translates between store requests and the consensus engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{
    CheckIsLeaderError, ClientWriteError, InstallSnapshotError, RaftError,
};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{Config, RaftMetrics, SnapshotPolicy};

use crate::actor::DbHandle;
use crate::command::{Command, CommandResult};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::raft::log_store::LogStore;
use crate::raft::network::{ClusterRouter, Network, RaftPeer};
use crate::raft::state_machine::SqlStateMachine;
use crate::raft::types::{raft_node_id, Node, NodeId, TypeConfig};

pub type RaftCore = openraft::Raft<TypeConfig>;

#[derive(Clone)]
pub struct RaftNode {
    raft_id: NodeId,
    pub(crate) raft: RaftCore,
    pub(crate) machine: SqlStateMachine,
}

impl RaftNode {
    /// Opens the log store and state machine, starts the raft core, and
    /// registers this node with the cluster router.
    pub(crate) async fn start(
        cfg: &StoreConfig,
        db: DbHandle,
        router: ClusterRouter,
    ) -> Result<Self> {
        let raft_id = raft_node_id(&cfg.id);
        let log_store = LogStore::open(&cfg.raft_path())?;
        let machine = SqlStateMachine::new(db, cfg.snapshot_path())?;

        let config = Config {
            heartbeat_interval: cfg.heartbeat_interval,
            election_timeout_min: cfg.election_timeout_min,
            election_timeout_max: cfg.election_timeout_max,
            // Snapshots are driven by the store's own scheduler; once one
            // exists the covered log span is released.
            snapshot_policy: SnapshotPolicy::Never,
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        };
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| StoreError::Consensus(e.to_string()))?,
        );

        let network = Network::new(router.clone());
        let raft = RaftCore::new(raft_id, config, network, log_store, machine.clone())
            .await
            .map_err(|e| StoreError::Consensus(e.to_string()))?;

        let node = Self {
            raft_id,
            raft,
            machine,
        };
        router.register(raft_id, Arc::new(node.clone()));
        Ok(node)
    }

    pub(crate) fn raft_id(&self) -> NodeId {
        self.raft_id
    }

    pub(crate) fn metrics(&self) -> RaftMetrics<NodeId, Node> {
        self.raft.metrics().borrow().clone()
    }

    /// Proposes a command and waits for commit + apply. On timeout the
    /// proposal may still commit later.
    pub(crate) async fn propose(
        &self,
        cmd: Command,
        timeout: Duration,
    ) -> Result<(u64, CommandResult)> {
        let write = self.raft.client_write(cmd);
        let response = tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(map_write_err)?;
        Ok((response.log_id.index, response.data))
    }

    /// Read-index barrier: resolves once every command committed before
    /// the call has been applied locally. Fails on non-leaders.
    pub(crate) async fn barrier(&self) -> Result<()> {
        self.raft
            .ensure_linearizable()
            .await
            .map_err(map_read_err)?;
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.raft.shutdown().await;
    }
}

#[async_trait]
impl RaftPeer for RaftNode {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> std::result::Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>> {
        self.raft.append_entries(req).await
    }

    async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> std::result::Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>
    {
        self.raft.install_snapshot(req).await
    }

    async fn vote(
        &self,
        req: VoteRequest<NodeId>,
    ) -> std::result::Result<VoteResponse<NodeId>, RaftError<NodeId>> {
        self.raft.vote(req).await
    }
}

pub(crate) fn map_write_err(e: RaftError<NodeId, ClientWriteError<NodeId, Node>>) -> StoreError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => StoreError::NotLeader,
        other => StoreError::Consensus(other.to_string()),
    }
}

pub(crate) fn map_read_err(e: RaftError<NodeId, CheckIsLeaderError<NodeId, Node>>) -> StoreError {
    match e {
        RaftError::APIError(CheckIsLeaderError::ForwardToLeader(_)) => StoreError::NotLeader,
        other => StoreError::Consensus(other.to_string()),
    }
}
