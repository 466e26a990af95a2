//! The replicated state machine: dispatches committed commands into the
//! SQL actor and owns snapshot build/install.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    AnyError, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::actor::DbHandle;
use crate::command::{Command, CommandResult};
use crate::error::{Result, StoreError};
use crate::raft::types::{Node, NodeId, TypeConfig};
use crate::snapshot::{SnapshotPayload, StoreSnapshot};

const META_LAST_APPLIED: &str = "last_applied";
const META_LAST_MEMBERSHIP: &str = "last_membership";

/// Apply target for the consensus engine. All replicated state lives
/// behind the SQL actor's single thread; this type only routes.
#[derive(Clone)]
pub struct SqlStateMachine {
    db: DbHandle,
    snapshot_dir: PathBuf,
    snapshot_count: Arc<AtomicU64>,
    last_snapshot_index: Arc<AtomicU64>,
}

fn read_err<E: std::fmt::Display>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read(AnyError::error(e.to_string())),
    }
}

fn write_err<E: std::fmt::Display>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write(AnyError::error(e.to_string())),
    }
}

fn snapshot_err<E: std::fmt::Display>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_snapshot(None, AnyError::error(e.to_string())),
    }
}

impl SqlStateMachine {
    pub(crate) fn new(db: DbHandle, snapshot_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&snapshot_dir)?;
        Ok(Self {
            db,
            snapshot_dir,
            snapshot_count: Arc::new(AtomicU64::new(0)),
            last_snapshot_index: Arc::new(AtomicU64::new(0)),
        })
    }

    pub(crate) fn snapshot_count(&self) -> Arc<AtomicU64> {
        self.snapshot_count.clone()
    }

    pub(crate) fn last_snapshot_index(&self) -> Arc<AtomicU64> {
        self.last_snapshot_index.clone()
    }

    async fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get_meta(key.to_string()).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| StoreError::Encoding(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.db.upsert_meta(key.to_string(), raw).await
    }

    /// Runs one committed command against the local state. SQL failures
    /// land inside the results and deliberately do not fail apply.
    async fn dispatch(&self, cmd: Command) -> Result<CommandResult> {
        match cmd {
            Command::Execute { request } => {
                Ok(CommandResult::Execute(self.db.execute(request).await?))
            }
            Command::Query { request } => {
                // Reads mutate nothing, so applying them everywhere keeps
                // replicas identical; only the proposer looks at the rows.
                Ok(CommandResult::Query(self.db.query(request).await?))
            }
            Command::MetadataSet { node_id, pairs } => {
                self.db.merge_node_meta(node_id, pairs).await?;
                Ok(CommandResult::None)
            }
            Command::MetadataDelete { node_id } => {
                self.db.delete_node_meta(node_id).await?;
                Ok(CommandResult::None)
            }
        }
    }

    /// Captures the full replicated state as a one-shot snapshot object.
    pub(crate) async fn build_store_snapshot(&self) -> Result<StoreSnapshot> {
        let contents = self.db.snapshot().await?;
        let last_applied: Option<LogId<NodeId>> = contents
            .last_applied
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let (term, index) = last_applied
            .map(|l| (l.leader_id.term, l.index))
            .unwrap_or((0, 0));
        let payload = SnapshotPayload {
            applied_term: term,
            applied_index: index,
            node_meta: contents.node_meta,
            db_bytes: contents.db_bytes,
        };
        Ok(StoreSnapshot::new(term, index, payload.encode()?))
    }

    /// Replaces SQL state and node metadata from an encoded snapshot
    /// stream. Used by snapshot install and by the public restore hook.
    pub(crate) async fn restore_from_bytes(&self, data: &[u8]) -> Result<()> {
        let payload = SnapshotPayload::decode(data)?;
        let tmp = self
            .snapshot_dir
            .join(format!("restore-{}.db", Uuid::new_v4()));
        tokio::fs::write(&tmp, &payload.db_bytes).await?;
        let restored = self.db.restore(payload.node_meta, tmp.clone()).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        restored?;
        self.last_snapshot_index
            .store(payload.applied_index, Ordering::SeqCst);
        info!(index = payload.applied_index, "restored snapshot");
        Ok(())
    }

    fn write_snapshot_files(
        &self,
        meta: &SnapshotMeta<NodeId, Node>,
        data: &[u8],
    ) -> Result<()> {
        let data_path = self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id));
        let meta_path = self
            .snapshot_dir
            .join(format!("{}.meta.json", meta.snapshot_id));
        std::fs::write(&data_path, data)?;
        let meta_bytes =
            serde_json::to_vec(meta).map_err(|e| StoreError::Encoding(e.to_string()))?;
        std::fs::write(&meta_path, meta_bytes)?;
        Ok(())
    }

    fn read_current_snapshot(&self) -> Result<Option<Snapshot<TypeConfig>>> {
        let mut best: Option<SnapshotMeta<NodeId, Node>> = None;
        for entry in std::fs::read_dir(&self.snapshot_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".meta.json") {
                continue;
            }
            let meta: SnapshotMeta<NodeId, Node> =
                match std::fs::read(entry.path())
                    .ok()
                    .and_then(|raw| serde_json::from_slice(&raw).ok())
                {
                    Some(meta) => meta,
                    None => continue,
                };
            let index = meta.last_log_id.map_or(0, |l| l.index);
            if best
                .as_ref()
                .map_or(true, |b| index > b.last_log_id.map_or(0, |l| l.index))
            {
                best = Some(meta);
            }
        }
        match best {
            Some(meta) => {
                let data =
                    std::fs::read(self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id)))?;
                Ok(Some(Snapshot {
                    meta,
                    snapshot: Box::new(Cursor::new(data)),
                }))
            }
            None => Ok(None),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SqlStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let contents = self.db.snapshot().await.map_err(snapshot_err)?;
        let last_applied: Option<LogId<NodeId>> = contents
            .last_applied
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(snapshot_err)?;
        let membership: StoredMembership<NodeId, Node> = contents
            .membership
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(snapshot_err)?
            .unwrap_or_default();

        let (term, index) = last_applied
            .map(|l| (l.leader_id.term, l.index))
            .unwrap_or((0, 0));
        let payload = SnapshotPayload {
            applied_term: term,
            applied_index: index,
            node_meta: contents.node_meta,
            db_bytes: contents.db_bytes,
        };
        let data = payload.encode().map_err(snapshot_err)?;

        let snapshot_id = format!("{}-{}-{}", term, index, Uuid::new_v4());
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };
        self.write_snapshot_files(&meta, &data).map_err(snapshot_err)?;
        self.snapshot_count.fetch_add(1, Ordering::SeqCst);
        self.last_snapshot_index.store(index, Ordering::SeqCst);
        info!(index, "built snapshot");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for SqlStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>>
    {
        let last_applied = self
            .get_meta::<LogId<NodeId>>(META_LAST_APPLIED)
            .await
            .map_err(read_err)?;
        let membership = self
            .get_meta::<StoredMembership<NodeId, Node>>(META_LAST_MEMBERSHIP)
            .await
            .map_err(read_err)?
            .unwrap_or_default();
        Ok((last_applied, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResult>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut responses = Vec::new();
        let mut last_log_id = None;

        for entry in entries {
            last_log_id = Some(entry.log_id);
            let response = match entry.payload {
                EntryPayload::Blank => CommandResult::None,
                EntryPayload::Normal(cmd) => {
                    debug!(index = entry.log_id.index, "applying command");
                    self.dispatch(cmd).await.map_err(write_err)?
                }
                EntryPayload::Membership(ref membership) => {
                    let stored = StoredMembership::new(Some(entry.log_id), membership.clone());
                    self.put_meta(META_LAST_MEMBERSHIP, &stored)
                        .await
                        .map_err(write_err)?;
                    CommandResult::None
                }
            };
            responses.push(response);
        }

        if let Some(log_id) = last_log_id {
            self.put_meta(META_LAST_APPLIED, &log_id)
                .await
                .map_err(write_err)?;
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        self.restore_from_bytes(&data).await.map_err(snapshot_err)?;

        // The stream's own meta section was written by the leader; the
        // consensus layer's view is authoritative for log position.
        if let Some(log_id) = meta.last_log_id {
            self.put_meta(META_LAST_APPLIED, &log_id)
                .await
                .map_err(snapshot_err)?;
        }
        self.put_meta(META_LAST_MEMBERSHIP, &meta.last_membership)
            .await
            .map_err(snapshot_err)?;

        self.write_snapshot_files(meta, &data).map_err(snapshot_err)?;
        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        self.read_current_snapshot().map_err(read_err)
    }
}
