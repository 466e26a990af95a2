//! Durable raft log and stable state on sled.
//!
//! Entries are persisted as [`LogRecord`]s: command payloads are framed
//! with the versioned command envelope, so the on-disk log format stays
//! stable even when internal types evolve.

use std::ops::{Bound, RangeBounds};

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{AnyError, Entry, EntryPayload, LogId, Membership, StorageError, StorageIOError, Vote};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::command::Command;
use crate::error::{Result, StoreError};
use crate::raft::types::{Node, NodeId, TypeConfig};

const TREE_LOG: &str = "log";
const TREE_META: &str = "meta";
const META_VOTE: &str = "vote";
const META_LAST_PURGED: &str = "last_purged";

#[derive(Clone)]
pub struct LogStore {
    #[allow(dead_code)]
    db: sled::Db,
    log_tree: sled::Tree,
    meta_tree: sled::Tree,
}

/// On-disk form of one log entry.
#[derive(Serialize, Deserialize)]
struct LogRecord {
    log_id: LogId<NodeId>,
    payload: RecordPayload,
}

#[derive(Serialize, Deserialize)]
enum RecordPayload {
    Blank,
    /// Envelope-framed [`Command`] bytes.
    Normal(Vec<u8>),
    Membership(Membership<NodeId, Node>),
}

impl LogRecord {
    fn from_entry(entry: &Entry<TypeConfig>) -> Result<Self> {
        let payload = match &entry.payload {
            EntryPayload::Blank => RecordPayload::Blank,
            EntryPayload::Normal(cmd) => RecordPayload::Normal(cmd.encode()?),
            EntryPayload::Membership(m) => RecordPayload::Membership(m.clone()),
        };
        Ok(Self {
            log_id: entry.log_id,
            payload,
        })
    }

    fn into_entry(self) -> Entry<TypeConfig> {
        let payload = match self.payload {
            RecordPayload::Blank => EntryPayload::Blank,
            RecordPayload::Normal(bytes) => match Command::decode(&bytes) {
                Ok(cmd) => EntryPayload::Normal(cmd),
                Err(e) => {
                    // Replaying a command we cannot decode would make this
                    // replica diverge silently; halting is the only safe
                    // option.
                    error!(index = self.log_id.index, error = %e, "unreadable raft log entry");
                    panic!(
                        "unreadable raft log entry at index {}: {}",
                        self.log_id.index, e
                    );
                }
            },
            RecordPayload::Membership(m) => EntryPayload::Membership(m),
        };
        Entry {
            log_id: self.log_id,
            payload,
        }
    }
}

impl LogStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        let log_tree = db
            .open_tree(TREE_LOG)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let meta_tree = db
            .open_tree(TREE_META)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            db,
            log_tree,
            meta_tree,
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn bound_to_vec(bound: Bound<&u64>) -> Bound<Vec<u8>> {
        match bound {
            Bound::Included(value) => Bound::Included(Self::log_key(*value).to_vec()),
            Bound::Excluded(value) => Bound::Excluded(Self::log_key(*value).to_vec()),
            Bound::Unbounded => Bound::Unbounded,
        }
    }

    fn to_read_error<E: std::fmt::Display>(e: E) -> StorageError<NodeId> {
        StorageError::IO {
            source: StorageIOError::read(AnyError::error(e.to_string())),
        }
    }

    fn to_write_error<E: std::fmt::Display>(e: E) -> StorageError<NodeId> {
        StorageError::IO {
            source: StorageIOError::write(AnyError::error(e.to_string())),
        }
    }

    fn read_last_purged(&self) -> Result<Option<LogId<NodeId>>> {
        if let Some(bytes) = self
            .meta_tree
            .get(META_LAST_PURGED)
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            let log_id =
                bincode::deserialize(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))?;
            Ok(Some(log_id))
        } else {
            Ok(None)
        }
    }

    fn write_last_purged(&self, log_id: LogId<NodeId>) -> Result<()> {
        let bytes = bincode::serialize(&log_id).map_err(|e| StoreError::Encoding(e.to_string()))?;
        self.meta_tree
            .insert(META_LAST_PURGED, bytes)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + openraft::OptionalSend,
    >(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = Self::bound_to_vec(range.start_bound());
        let end = Self::bound_to_vec(range.end_bound());
        let mut entries = Vec::new();
        for item in self.log_tree.range((start, end)) {
            let (_, value) = item.map_err(Self::to_read_error)?;
            let record: LogRecord =
                bincode::deserialize(&value).map_err(Self::to_read_error)?;
            entries.push(record.into_entry());
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogStore;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = self.read_last_purged().map_err(Self::to_read_error)?;

        let last_log_id = if let Some(item) = self.log_tree.iter().next_back() {
            let (_, value) = item.map_err(Self::to_read_error)?;
            let record: LogRecord =
                bincode::deserialize(&value).map_err(Self::to_read_error)?;
            Some(record.log_id)
        } else {
            last_purged_log_id
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = bincode::serialize(vote).map_err(Self::to_write_error)?;
        self.meta_tree
            .insert(META_VOTE, bytes)
            .map_err(Self::to_write_error)?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        if let Some(bytes) = self
            .meta_tree
            .get(META_VOTE)
            .map_err(Self::to_read_error)?
        {
            let vote = bincode::deserialize(&bytes).map_err(Self::to_read_error)?;
            Ok(Some(vote))
        } else {
            Ok(None)
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        for entry in entries {
            let key = Self::log_key(entry.log_id.index).to_vec();
            let record = LogRecord::from_entry(&entry).map_err(Self::to_write_error)?;
            let value = bincode::serialize(&record).map_err(Self::to_write_error)?;
            self.log_tree
                .insert(key, value)
                .map_err(Self::to_write_error)?;
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let start_key = Self::log_key(log_id.index).to_vec();
        let keys: Vec<Vec<u8>> = self
            .log_tree
            .range(start_key..)
            .map(|item| item.map(|(key, _)| key.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::to_read_error)?;
        for key in keys {
            self.log_tree.remove(key).map_err(Self::to_write_error)?;
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let end_key = Self::log_key(log_id.index).to_vec();
        let keys: Vec<Vec<u8>> = self
            .log_tree
            .range(..=end_key)
            .map(|item| item.map(|(key, _)| key.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::to_read_error)?;
        for key in keys {
            self.log_tree.remove(key).map_err(Self::to_write_error)?;
        }
        self.write_last_purged(log_id)
            .map_err(Self::to_write_error)?;
        Ok(())
    }
}
