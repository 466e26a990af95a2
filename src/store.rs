//! The store façade: applies client SQL through the consensus log, gates
//! reads by consistency level, and manages membership, metadata, backups
//! and snapshots for one node.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openraft::error::{InitializeError, RaftError};
use openraft::{ChangeMembers, ServerState};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{BackupFormat, DbHandle};
use crate::command::{
    Command, CommandResult, Consistency, ExecuteRequest, ExecuteResult, QueryRequest, QueryResult,
    Statement,
};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::raft::network::ClusterRouter;
use crate::raft::node::{map_write_err, RaftNode};
use crate::raft::types::{raft_node_id, Node, NodeId};
use crate::snapshot::{SnapshotScheduler, StoreSnapshot};

/// Node role as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Leader,
    Follower,
    Candidate,
    Shutdown,
}

/// A replicated SQL store node.
///
/// Writes are proposed through the consensus log and applied by a single
/// apply thread on every node; reads are served locally subject to the
/// requested [`Consistency`] level.
pub struct Store {
    id: String,
    addr: String,
    raft_id: NodeId,
    dir: PathBuf,
    apply_timeout: Duration,
    db: DbHandle,
    node: RaftNode,
    router: ClusterRouter,
    /// Last instant a leader was observed; drives `None`-read freshness.
    last_contact: Arc<Mutex<Instant>>,
    closed: Arc<AtomicBool>,
    snapshot_count: Arc<AtomicU64>,
    contact_task: JoinHandle<()>,
    snapshot_task: JoinHandle<()>,
}

impl Store {
    /// Initializes storage under `config.dir` and starts the node. With
    /// `bootstrap`, forms a single-node cluster (idempotent across
    /// restarts).
    pub async fn open(
        config: StoreConfig,
        router: ClusterRouter,
        bootstrap: bool,
    ) -> Result<Self> {
        if config.id.is_empty() {
            return Err(StoreError::InvalidRequest(
                "node id must not be empty".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.dir)?;

        // No raft state yet means this node starts from log index zero,
        // even over a database file imported from a backup.
        let fresh_node = !config.raft_path().exists();
        let db = DbHandle::spawn(config.sqlite_path(), config.dir.join("tmp"), fresh_node)?;
        let node = RaftNode::start(&config, db.clone(), router.clone()).await?;

        if bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                node.raft_id(),
                Node::new(&config.id, &config.addr),
            );
            match node.raft.initialize(members).await {
                Ok(()) => {}
                // Already initialized: a restart of a bootstrapped node.
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {}
                Err(e) => return Err(StoreError::Consensus(e.to_string())),
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let last_contact = Arc::new(Mutex::new(Instant::now()));
        let contact_task = {
            let raft = node.raft.clone();
            let last_contact = last_contact.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(50));
                loop {
                    tick.tick().await;
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if raft.metrics().borrow().current_leader.is_some() {
                        *last_contact.lock().unwrap() = Instant::now();
                    }
                }
            })
        };

        let snapshot_count = node.machine.snapshot_count();
        let snapshot_task = SnapshotScheduler::new(
            node.raft.clone(),
            config.snapshot_threshold,
            node.machine.last_snapshot_index(),
        )
        .spawn(config.snapshot_interval);

        info!(id = %config.id, addr = %config.addr, bootstrap, "store opened");
        Ok(Self {
            id: config.id,
            addr: config.addr,
            raft_id: node.raft_id(),
            dir: config.dir,
            apply_timeout: config.apply_timeout,
            db,
            node,
            router,
            last_contact,
            closed,
            snapshot_count,
            contact_task,
            snapshot_task,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Drains and shuts the node down: stops background tasks, stops the
    /// consensus engine, detaches from the cluster router and closes the
    /// SQL connection. A second close is a no-op.
    pub async fn close(&self, wait: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.contact_task.abort();
        self.snapshot_task.abort();
        self.node.shutdown().await;
        self.router.deregister(self.raft_id);
        self.db.close(wait).await;
        info!(id = %self.id, "store closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Proposes a batch of mutating statements through the log and returns
    /// the per-statement results once applied locally. Fails with
    /// [`StoreError::NotLeader`] on non-leaders.
    pub async fn execute(&self, req: &ExecuteRequest) -> Result<Vec<ExecuteResult>> {
        self.ensure_open()?;
        let cmd = Command::Execute {
            request: req.clone(),
        };
        let (index, result) = self.node.propose(cmd, self.apply_timeout).await?;
        debug!(index, "execute applied");
        match result {
            CommandResult::Execute(results) => Ok(results),
            other => Err(StoreError::Consensus(format!(
                "unexpected apply result: {other:?}"
            ))),
        }
    }

    /// Like [`Store::execute`], but when any statement fails a `ROLLBACK`
    /// is proposed afterwards so the batch cannot leave a transaction open
    /// — the batch's own `BEGIN` included. The rollback replicates like
    /// any other write, so every node resets identically; with no active
    /// transaction it is silently ignored at the SQL layer.
    pub async fn execute_or_abort(&self, req: &ExecuteRequest) -> Result<Vec<ExecuteResult>> {
        let results = self.execute(req).await?;
        if results.iter().any(|r| r.error.is_some()) {
            let rollback = ExecuteRequest::new(vec![Statement::new("ROLLBACK")]);
            if let Err(e) = self.execute(&rollback).await {
                warn!(error = %e, "rollback after failed batch did not apply");
            }
        }
        Ok(results)
    }

    /// Runs read-only statements at the requested consistency level.
    pub async fn query(&self, req: &QueryRequest) -> Result<Vec<QueryResult>> {
        self.ensure_open()?;
        match req.level {
            Consistency::Strong => {
                // Barrier first: everything committed before this call is
                // applied locally, then the read is leader-local.
                self.node.barrier().await?;
            }
            Consistency::Weak => {
                if !self.is_leader() {
                    return Err(StoreError::NotLeader);
                }
            }
            Consistency::None => {
                // Freshness only constrains non-leaders; the leader is
                // fresh by definition. Zero disables the check.
                if !req.freshness.is_zero() && !self.is_leader() {
                    let last = *self.last_contact.lock().unwrap();
                    if last.elapsed() > req.freshness {
                        return Err(StoreError::StaleRead);
                    }
                }
            }
        }
        Ok(self.db.query(req.clone()).await?)
    }

    /// Streams a backup of the SQL state into `sink`. With `leader_only`,
    /// non-leaders refuse so callers get a consistent, current image.
    pub async fn backup<W: Write>(
        &self,
        leader_only: bool,
        format: BackupFormat,
        sink: &mut W,
    ) -> Result<()> {
        self.ensure_open()?;
        if leader_only && !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        let bytes = self.db.backup(format).await?;
        sink.write_all(&bytes)?;
        Ok(())
    }

    /// Adds a node to the cluster as voter or non-voter and records its
    /// initial metadata. Leader-only. Re-joining with an unchanged address
    /// is a no-op success.
    pub async fn join(
        &self,
        id: &str,
        addr: &str,
        voter: bool,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        self.ensure_open()?;
        if id.is_empty() {
            return Err(StoreError::InvalidRequest(
                "node id must not be empty".to_string(),
            ));
        }
        let raft_id = raft_node_id(id);

        let metrics = self.node.metrics();
        let membership = metrics.membership_config.membership();
        let existing = membership
            .nodes()
            .find(|(nid, _)| **nid == raft_id)
            .map(|(_, n)| n.clone());
        let is_voter = membership.voter_ids().any(|v| v == raft_id);

        if let Some(node) = existing {
            if node.addr == addr && is_voter == voter {
                debug!(id, addr, "node already a member");
                if let Some(pairs) = metadata {
                    self.propose_metadata_set(id, pairs).await?;
                }
                return Ok(());
            }
        }

        self.node
            .raft
            .add_learner(raft_id, Node::new(id, addr), true)
            .await
            .map_err(map_write_err)?;

        if voter {
            let mut ids = BTreeSet::new();
            ids.insert(raft_id);
            self.node
                .raft
                .change_membership(ChangeMembers::AddVoterIds(ids), true)
                .await
                .map_err(map_write_err)?;
        }

        if let Some(pairs) = metadata {
            self.propose_metadata_set(id, pairs).await?;
        }
        info!(id, addr, voter, "node joined");
        Ok(())
    }

    /// Removes a node from the cluster and deletes its metadata entry.
    /// Leader-only. Removing an unknown node is a no-op success.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let raft_id = raft_node_id(id);

        let metrics = self.node.metrics();
        let membership = metrics.membership_config.membership();
        if !membership.nodes().any(|(nid, _)| *nid == raft_id) {
            return Ok(());
        }
        let is_voter = membership.voter_ids().any(|v| v == raft_id);

        let mut ids = BTreeSet::new();
        ids.insert(raft_id);
        if is_voter {
            self.node
                .raft
                .change_membership(ChangeMembers::RemoveVoters(ids.clone()), false)
                .await
                .map_err(map_write_err)?;
        }
        let still_present = self
            .node
            .metrics()
            .membership_config
            .membership()
            .nodes()
            .any(|(nid, _)| *nid == raft_id);
        if still_present {
            self.node
                .raft
                .change_membership(ChangeMembers::RemoveNodes(ids), false)
                .await
                .map_err(map_write_err)?;
        }

        self.node
            .propose(
                Command::MetadataDelete {
                    node_id: id.to_string(),
                },
                self.apply_timeout,
            )
            .await?;
        info!(id, "node removed");
        Ok(())
    }

    /// Current cluster members, sorted lexicographically by id.
    pub fn nodes(&self) -> Vec<Node> {
        let metrics = self.node.metrics();
        let mut nodes: Vec<Node> = metrics
            .membership_config
            .membership()
            .nodes()
            .map(|(_, n)| n.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Merges `pairs` into this node's replicated metadata. Leader-only.
    pub async fn set_metadata(&self, pairs: BTreeMap<String, String>) -> Result<()> {
        self.ensure_open()?;
        let id = self.id.clone();
        self.propose_metadata_set(&id, pairs).await
    }

    async fn propose_metadata_set(
        &self,
        id: &str,
        pairs: BTreeMap<String, String>,
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.node
            .propose(
                Command::MetadataSet {
                    node_id: id.to_string(),
                    pairs,
                },
                self.apply_timeout,
            )
            .await?;
        Ok(())
    }

    /// Local metadata read; empty string for unknown node or key.
    pub async fn metadata(&self, node_id: &str, key: &str) -> String {
        if self.closed.load(Ordering::SeqCst) {
            return String::new();
        }
        self.db
            .node_meta(node_id.to_string(), key.to_string())
            .await
            .unwrap_or_default()
    }

    /// Captures a snapshot of the full replicated state at the current
    /// applied index.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.ensure_open()?;
        self.node.machine.build_store_snapshot().await
    }

    /// Replaces the SQL state and metadata from a snapshot stream. The log
    /// tail past the snapshot's index replays on top afterwards.
    pub async fn restore<R: Read>(&self, mut src: R) -> Result<()> {
        self.ensure_open()?;
        let mut data = Vec::new();
        src.read_to_end(&mut data)?;
        self.node.machine.restore_from_bytes(&data).await
    }

    /// Blocks until a leader is observed, returning its address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        self.node
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader observed")
            .await
            .map_err(|_| StoreError::Timeout)?;
        Ok(self.leader_addr())
    }

    /// Blocks until at least `index` has been applied locally.
    pub async fn wait_for_applied_index(&self, index: u64, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.node
            .raft
            .wait(Some(timeout))
            .metrics(
                move |m| m.last_applied.map_or(0, |l| l.index) >= index,
                "applied index reached",
            )
            .await
            .map_err(|_| StoreError::Timeout)?;
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.node.metrics().state == ServerState::Leader
    }

    pub fn state(&self) -> State {
        if self.closed.load(Ordering::SeqCst) {
            return State::Shutdown;
        }
        match self.node.metrics().state {
            ServerState::Leader => State::Leader,
            ServerState::Candidate => State::Candidate,
            _ => State::Follower,
        }
    }

    /// Address of the last-known leader; empty when none is known.
    pub fn leader_addr(&self) -> String {
        self.lookup_leader().map(|n| n.addr).unwrap_or_default()
    }

    /// Public id of the last-known leader; empty when none is known.
    pub fn leader_id(&self) -> String {
        self.lookup_leader().map(|n| n.id).unwrap_or_default()
    }

    fn lookup_leader(&self) -> Option<Node> {
        let metrics = self.node.metrics();
        let leader = metrics.current_leader?;
        let node = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(nid, _)| **nid == leader)
            .map(|(_, n)| n.clone());
        node
    }

    /// Highest log index applied to this node's state machine.
    pub fn applied_index(&self) -> u64 {
        self.node.metrics().last_applied.map_or(0, |l| l.index)
    }

    /// Number of snapshots this node has taken since opening.
    pub fn num_snapshots(&self) -> u64 {
        self.snapshot_count.load(Ordering::SeqCst)
    }
}
